use pest::iterators::{Pair, Pairs};
use pest::Parser as _;
use pest_derive::*;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use thiserror::Error;

#[derive(Parser)]
#[grammar = "rfc2033.pest"]
struct Parser;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct PathError(pub String);

/// How lenient [`parse_path`] should be. LMTP `RCPT TO` accepts a bare
/// local part; `MAIL FROM` accepts the null path `<>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathFlags {
    pub allow_empty: bool,
    pub allow_localpart_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Domain {
    Name(String),
    V4(String),
    V6(String),
    Tagged { tag: String, literal: String },
}

impl std::fmt::Display for Domain {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Name(name) => write!(fmt, "{name}"),
            Self::V4(addr) => write!(fmt, "[{addr}]"),
            Self::V6(addr) => write!(fmt, "[IPv6:{addr}]"),
            Self::Tagged { tag, literal } => write!(fmt, "[{tag}:{literal}]"),
        }
    }
}

/// An SMTP envelope address. The distinguished empty form `<>` is
/// represented by an empty local part with no domain and encodes to
/// the empty string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpAddress {
    pub local_part: String,
    pub domain: Option<Domain>,
}

impl SmtpAddress {
    pub fn null() -> Self {
        Self {
            local_part: String::new(),
            domain: None,
        }
    }

    pub fn is_null(&self) -> bool {
        self.local_part.is_empty() && self.domain.is_none()
    }

    /// Canonical serialization: `local@domain`, a bare local part,
    /// or the empty string for the null path.
    pub fn encode(&self) -> String {
        match &self.domain {
            Some(domain) => format!("{}@{domain}", self.local_part),
            None => self.local_part.clone(),
        }
    }

    /// Split the local part at the first occurrence of any of the
    /// configured delimiter characters, yielding
    /// `(username, delimiter, detail)`. A quoted local part is never
    /// split.
    pub fn split_detail(&self, delimiters: &str) -> (String, Option<char>, String) {
        if self.local_part.starts_with('"') {
            return (self.local_part.clone(), None, String::new());
        }
        match self.local_part.find(|c| delimiters.contains(c)) {
            Some(idx) => {
                let delim = self.local_part[idx..].chars().next();
                let detail_at = idx + delim.map(char::len_utf8).unwrap_or(1);
                (
                    self.local_part[..idx].to_string(),
                    delim,
                    self.local_part[detail_at..].to_string(),
                )
            }
            None => (self.local_part.clone(), None, String::new()),
        }
    }

    /// Re-attach a detail suffix to this address using the original
    /// delimiter, used when a directory lookup rewrites the username.
    pub fn with_detail(&self, detail: &str, delim: char) -> Self {
        Self {
            local_part: format!("{}{delim}{detail}", self.local_part),
            domain: self.domain.clone(),
        }
    }
}

impl std::fmt::Display for SmtpAddress {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}", self.encode())
    }
}

/// Parse an SMTP path from the front of `text`, returning the address
/// and the unconsumed remainder (which the caller inspects for ESMTP
/// parameters). Both `<local@domain>` and the unbracketed lenient form
/// are accepted; parameters require the bracketed form.
pub fn parse_path(text: &str, flags: PathFlags) -> Result<(SmtpAddress, &str), PathError> {
    let text = text.trim_start_matches(' ');
    if let Some(rest) = text.strip_prefix('<') {
        let end = rest
            .find('>')
            .ok_or_else(|| PathError("missing '>' in path".to_string()))?;
        let inner = &rest[..end];
        let remainder = &rest[end + 1..];
        if inner.is_empty() {
            if !flags.allow_empty {
                return Err(PathError("null path not allowed".to_string()));
            }
            return Ok((SmtpAddress::null(), remainder));
        }
        Ok((parse_mailbox(inner, flags)?, remainder))
    } else {
        let (candidate, remainder) = match text.split_once(' ') {
            Some((candidate, _)) if candidate.is_empty() => {
                return Err(PathError("empty path".to_string()))
            }
            Some((candidate, remainder)) => (candidate, remainder),
            None => (text, ""),
        };
        if !remainder.is_empty() {
            return Err(PathError(
                "must enclose address in <> if you want to use ESMTP parameters".to_string(),
            ));
        }
        Ok((parse_mailbox(candidate, flags)?, ""))
    }
}

/// Parse a bare username as returned by a directory lookup; it may be
/// either `local@domain` or a plain local part.
pub fn parse_username(text: &str) -> Result<SmtpAddress, PathError> {
    parse_mailbox(
        text,
        PathFlags {
            allow_empty: false,
            allow_localpart_only: true,
        },
    )
}

fn parse_mailbox(text: &str, flags: PathFlags) -> Result<SmtpAddress, PathError> {
    // Source routes must be accepted and ignored (RFC 5321 appendix C)
    let text = if text.starts_with('@') {
        match text.find(':') {
            Some(colon) => &text[colon + 1..],
            None => return Err(PathError("invalid source route".to_string())),
        }
    } else {
        text
    };

    match Parser::parse(Rule::complete_mailbox, text) {
        Ok(mut parsed) => {
            let mailbox = parsed.next().unwrap().into_inner().next().unwrap();
            parse_mailbox_pairs(mailbox.into_inner())
        }
        Err(err) => {
            if flags.allow_localpart_only {
                if Parser::parse(Rule::complete_local_part, text).is_ok() {
                    return Ok(SmtpAddress {
                        local_part: text.to_string(),
                        domain: None,
                    });
                }
            }
            Err(PathError(format!("invalid mailbox: {err}")))
        }
    }
}

fn parse_mailbox_pairs(mut pairs: Pairs<Rule>) -> Result<SmtpAddress, PathError> {
    let local_part = pairs.next().unwrap().as_str().to_string();
    let domain = parse_domain_pair(pairs.next().unwrap())?;
    Ok(SmtpAddress {
        local_part,
        domain: Some(domain),
    })
}

fn parse_domain_pair(pair: Pair<Rule>) -> Result<Domain, PathError> {
    Ok(match pair.as_rule() {
        Rule::domain => Domain::Name(pair.as_str().to_string()),
        Rule::address_literal => {
            let literal = pair.into_inner().next().unwrap();
            match literal.as_rule() {
                Rule::ipv4_address_literal => Domain::V4(literal.as_str().to_string()),
                Rule::ipv6_address_literal => {
                    Domain::V6(literal.into_inner().next().unwrap().as_str().to_string())
                }
                Rule::general_address_literal => {
                    let mut literal = literal.into_inner();
                    let tag = literal.next().unwrap().as_str().to_string();
                    let literal = literal.next().unwrap().as_str().to_string();
                    Domain::Tagged { tag, literal }
                }
                wat => return Err(PathError(format!("unexpected {wat:?}"))),
            }
        }
        wat => return Err(PathError(format!("unexpected {wat:?}"))),
    })
}

pub fn is_valid_domain(text: &str) -> bool {
    Parser::parse(Rule::complete_domain, text).is_ok()
}

/// Recognize an RFC 2034/3463 enhanced status code at the front of a
/// reply line, yielding `(class, subject, detail)` and the text after
/// it. A line whose start merely resembles a code (wrong class, too
/// many fields, nothing following) is left alone.
pub fn parse_enhanced_prefix(line: &str) -> Option<(u8, u16, u16, &str)> {
    let prefix = Parser::parse(Rule::status_code_prefix, line).ok()?.next()?;
    let consumed = prefix.as_str().len();
    let mut digits = prefix.into_inner();
    let class = digits.next()?.as_str().parse().ok()?;
    let subject = digits.next()?.as_str().parse().ok()?;
    let detail = digits.next()?.as_str().parse().ok()?;
    Some((class, subject, detail, &line[consumed..]))
}

/// Interpret an LHLO argument. An address literal is validated for the
/// absence of `\` and nested `[`; anything else must be a dot-atom.
/// Unparsable input canonicalizes to the literal greeting name
/// `"invalid"` rather than failing the command, for compatibility with
/// sloppy clients.
pub fn parse_lhlo_domain(arg: &str) -> String {
    if let Some(rest) = arg.strip_prefix('[') {
        for (idx, b) in rest.bytes().enumerate() {
            match b {
                b']' => {
                    if idx + 1 == rest.len() {
                        return arg.to_string();
                    }
                    break;
                }
                b'\\' | b'[' => break,
                _ => {}
            }
        }
        return "invalid".to_string();
    }
    if Parser::parse(Rule::complete_dot_atom, arg).is_ok() {
        arg.to_string()
    } else {
        "invalid".to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EsmtpParameter {
    pub name: String,
    pub value: Option<String>,
}

impl std::fmt::Display for EsmtpParameter {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.value {
            Some(value) => write!(fmt, "{}={value}", self.name),
            None => write!(fmt, "{}", self.name),
        }
    }
}

/// Parameter list errors map to distinct SMTP replies: syntax errors
/// to 501, parameters outside the advertised capability set to 555.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParamError {
    #[error("{0}")]
    BadSyntax(String),
    #[error("{0}")]
    NotSupported(String),
}

fn parse_param_tokens(text: &str) -> Result<Vec<EsmtpParameter>, ParamError> {
    let mut params = vec![];
    for token in text.split(' ') {
        if token.is_empty() {
            continue;
        }
        let mut parsed = Parser::parse(Rule::complete_esmtp_param, token)
            .map_err(|_| ParamError::BadSyntax(format!("Invalid parameter: {token}")))?;
        let mut inner = parsed.next().unwrap().into_inner().next().unwrap().into_inner();
        let name = inner.next().unwrap().as_str().to_string();
        let value = inner.next().map(|p| p.as_str().to_string());
        params.push(EsmtpParameter { name, value });
    }
    Ok(params)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyType {
    #[default]
    SevenBit,
    EightBitMime,
}

/// MAIL FROM parameters, parsed against the 8BITMIME capability set.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MailParams {
    pub body: Option<BodyType>,
    pub size: Option<u64>,
    raw: Vec<EsmtpParameter>,
}

impl MailParams {
    pub fn parse(text: &str) -> Result<Self, ParamError> {
        let raw = parse_param_tokens(text)?;
        let mut params = Self {
            raw: raw.clone(),
            ..Self::default()
        };
        for param in raw {
            match param.name.to_ascii_uppercase().as_str() {
                "BODY" => match param.value.as_deref() {
                    Some(v) if v.eq_ignore_ascii_case("7BIT") => {
                        params.body = Some(BodyType::SevenBit);
                    }
                    Some(v) if v.eq_ignore_ascii_case("8BITMIME") => {
                        params.body = Some(BodyType::EightBitMime);
                    }
                    _ => {
                        return Err(ParamError::NotSupported(format!(
                            "Unsupported mail BODY type: {}",
                            param.value.as_deref().unwrap_or("")
                        )))
                    }
                },
                "SIZE" => {
                    let value = param
                        .value
                        .as_deref()
                        .ok_or_else(|| ParamError::BadSyntax("Missing SIZE value".to_string()))?;
                    params.size = Some(value.parse().map_err(|_| {
                        ParamError::BadSyntax(format!("Invalid SIZE value: {value}"))
                    })?);
                }
                _ => {
                    return Err(ParamError::NotSupported(format!(
                        "Unsupported mail parameter: {}",
                        param.name
                    )))
                }
            }
        }
        Ok(params)
    }

    /// The parameters as originally given, for relaying to an upstream.
    pub fn encode(&self) -> String {
        encode_params(&self.raw)
    }
}

/// RCPT TO parameters, parsed against the DSN capability set.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RcptParams {
    pub notify: Vec<String>,
    pub orcpt: Option<SmtpAddress>,
    raw: Vec<EsmtpParameter>,
}

impl RcptParams {
    pub fn parse(text: &str) -> Result<Self, ParamError> {
        let raw = parse_param_tokens(text)?;
        let mut params = Self {
            raw: raw.clone(),
            ..Self::default()
        };
        for param in raw {
            match param.name.to_ascii_uppercase().as_str() {
                "NOTIFY" => {
                    let value = param
                        .value
                        .as_deref()
                        .ok_or_else(|| ParamError::BadSyntax("Missing NOTIFY value".to_string()))?;
                    let mut notify = vec![];
                    for keyword in value.split(',') {
                        match keyword.to_ascii_uppercase().as_str() {
                            "NEVER" | "SUCCESS" | "FAILURE" | "DELAY" => {
                                notify.push(keyword.to_ascii_uppercase())
                            }
                            _ => {
                                return Err(ParamError::BadSyntax(format!(
                                    "Invalid NOTIFY keyword: {keyword}"
                                )))
                            }
                        }
                    }
                    if notify.iter().any(|k| k == "NEVER") && notify.len() > 1 {
                        return Err(ParamError::BadSyntax(
                            "NOTIFY=NEVER cannot be combined".to_string(),
                        ));
                    }
                    params.notify = notify;
                }
                "ORCPT" => {
                    let value = param
                        .value
                        .as_deref()
                        .ok_or_else(|| ParamError::BadSyntax("Missing ORCPT value".to_string()))?;
                    let (addr_type, addr) = value.split_once(';').ok_or_else(|| {
                        ParamError::BadSyntax("Invalid ORCPT: missing address type".to_string())
                    })?;
                    if !addr_type.eq_ignore_ascii_case("rfc822") {
                        return Err(ParamError::BadSyntax(format!(
                            "Unsupported ORCPT address type: {addr_type}"
                        )));
                    }
                    let decoded = decode_xtext(addr).ok_or_else(|| {
                        ParamError::BadSyntax("Invalid ORCPT xtext encoding".to_string())
                    })?;
                    let address = parse_username(&decoded).map_err(|err| {
                        ParamError::BadSyntax(format!("Invalid ORCPT address: {err}"))
                    })?;
                    params.orcpt = Some(address);
                }
                _ => {
                    return Err(ParamError::NotSupported(format!(
                        "Unsupported rcpt parameter: {}",
                        param.name
                    )))
                }
            }
        }
        Ok(params)
    }

    pub fn encode(&self) -> String {
        encode_params(&self.raw)
    }
}

fn encode_params(params: &[EsmtpParameter]) -> String {
    let mut out = String::new();
    for param in params {
        out.push(' ');
        out.push_str(&param.to_string());
    }
    out
}

fn decode_xtext(text: &str) -> Option<String> {
    let mut out = String::with_capacity(text.len());
    let mut bytes = text.bytes();
    while let Some(b) = bytes.next() {
        if b == b'+' {
            let hi = bytes.next()?;
            let lo = bytes.next()?;
            let hex = [hi, lo];
            let hex = std::str::from_utf8(&hex).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()? as char);
        } else {
            out.push(b as char);
        }
    }
    Some(out)
}

/// XCLIENT attributes supplied by a trusted front-end. Any attribute
/// that fails to parse fails the whole command; unknown attributes are
/// ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XclientParams {
    pub addr: Option<IpAddr>,
    pub port: Option<u16>,
    pub ttl: Option<u32>,
    pub timeout: Option<u32>,
}

impl XclientParams {
    pub fn parse(args: &str) -> Result<Self, PathError> {
        let mut params = Self::default();
        for token in args.split(' ') {
            if token.is_empty() {
                continue;
            }
            let (key, value) = match token.split_once('=') {
                Some((key, value)) => (key, value),
                None => (token, ""),
            };
            if key.eq_ignore_ascii_case("ADDR") {
                let (value, require_v6) = match value
                    .get(..5)
                    .filter(|prefix| prefix.eq_ignore_ascii_case("IPV6:"))
                {
                    Some(_) => (&value[5..], true),
                    None => (value, false),
                };
                let ip: IpAddr = value
                    .parse()
                    .map_err(|_| PathError(format!("invalid ADDR: {value}")))?;
                if require_v6 && !ip.is_ipv6() {
                    return Err(PathError(format!("invalid ADDR: {value}")));
                }
                params.addr = Some(ip);
            } else if key.eq_ignore_ascii_case("PORT") {
                params.port = Some(
                    value
                        .parse()
                        .map_err(|_| PathError(format!("invalid PORT: {value}")))?,
                );
            } else if key.eq_ignore_ascii_case("TTL") {
                params.ttl = Some(
                    value
                        .parse()
                        .map_err(|_| PathError(format!("invalid TTL: {value}")))?,
                );
            } else if key.eq_ignore_ascii_case("TIMEOUT") {
                params.timeout = Some(
                    value
                        .parse()
                        .map_err(|_| PathError(format!("invalid TIMEOUT: {value}")))?,
                );
            }
        }
        Ok(params)
    }
}
