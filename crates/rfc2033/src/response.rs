use crate::parser::parse_enhanced_prefix;
use serde::{Deserialize, Serialize};

/// An SMTP reply, together with the RFC 2034 enhanced status code when
/// the peer supplied one.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Hash)]
pub struct Response {
    pub code: u16,
    pub enhanced_code: Option<EnhancedStatusCode>,
    pub content: String,
    pub command: Option<String>,
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy, Hash)]
pub struct EnhancedStatusCode {
    pub class: u8,
    pub subject: u16,
    pub detail: u16,
}

impl std::fmt::Display for EnhancedStatusCode {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

impl Response {
    pub fn is_transient(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    pub fn is_permanent(&self) -> bool {
        self.code >= 500 && self.code < 600
    }

    pub fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    /// Render the reply as a single wire line, restoring the enhanced
    /// status code prefix. Embedded line breaks collapse to spaces so
    /// that a multi-line upstream reply can be relayed as one
    /// per-recipient status line.
    pub fn to_single_line(&self) -> String {
        let mut line = format!("{} ", self.code);
        if let Some(enh) = &self.enhanced_code {
            line.push_str(&format!("{enh} "));
        }
        let mut first = true;
        for text in self.content.lines() {
            if !first {
                line.push(' ');
            }
            line.push_str(text);
            first = false;
        }
        line
    }
}

/// One parsed line of a (possibly multi-line) reply.
#[derive(Debug, PartialEq, Eq)]
pub struct ResponseLine<'a> {
    pub code: u16,
    pub is_final: bool,
    pub content: &'a str,
}

impl<'a> ResponseLine<'a> {
    /// `250-foo` continues a reply, `250 foo` finishes it.
    pub fn parse(line: &'a str) -> Option<Self> {
        if line.len() < 3 {
            return None;
        }
        let code: u16 = line.get(0..3)?.parse().ok()?;
        match line.as_bytes().get(3) {
            None => Some(Self {
                code,
                is_final: true,
                content: "",
            }),
            Some(b' ') => Some(Self {
                code,
                is_final: true,
                content: &line[4..],
            }),
            Some(b'-') => Some(Self {
                code,
                is_final: false,
                content: &line[4..],
            }),
            Some(_) => None,
        }
    }
}

/// Accumulates [`ResponseLine`]s into a single [`Response`]. The
/// enhanced status code is recognized on the first line and stripped
/// from continuation lines that repeat it.
pub struct ResponseBuilder {
    code: u16,
    enhanced_code: Option<EnhancedStatusCode>,
    content: String,
}

impl ResponseBuilder {
    pub fn new(line: &ResponseLine) -> Self {
        let (enhanced_code, content) = match parse_enhanced_prefix(line.content) {
            Some((class, subject, detail, rest)) => (
                Some(EnhancedStatusCode {
                    class,
                    subject,
                    detail,
                }),
                rest.to_string(),
            ),
            None => (None, line.content.to_string()),
        };
        Self {
            code: line.code,
            enhanced_code,
            content,
        }
    }

    pub fn add_line(&mut self, line: &ResponseLine) -> Result<(), String> {
        if line.code != self.code {
            return Err(format!(
                "reply code changed from {} to {} mid-response",
                self.code, line.code
            ));
        }
        self.content.push('\n');
        let mut content = line.content;
        if let Some(enh) = &self.enhanced_code {
            if let Some(remainder) = content.strip_prefix(&format!("{enh} ")) {
                content = remainder;
            }
        }
        self.content.push_str(content);
        Ok(())
    }

    pub fn build(self, command: Option<String>) -> Response {
        Response {
            code: self.code,
            enhanced_code: self.enhanced_code,
            content: self.content,
            command,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn response_line_forms() {
        assert_eq!(
            ResponseLine::parse("250-mx.example.com"),
            Some(ResponseLine {
                code: 250,
                is_final: false,
                content: "mx.example.com"
            })
        );
        assert_eq!(
            ResponseLine::parse("250 PIPELINING"),
            Some(ResponseLine {
                code: 250,
                is_final: true,
                content: "PIPELINING"
            })
        );
        assert_eq!(ResponseLine::parse("woot"), None);
        assert_eq!(ResponseLine::parse("25"), None);
    }

    #[test]
    fn enhanced_codes() {
        let response = ResponseBuilder::new(&ResponseLine::parse("250 2.1.5 OK").unwrap())
            .build(None);
        assert_eq!(
            response.enhanced_code,
            Some(EnhancedStatusCode {
                class: 2,
                subject: 1,
                detail: 5
            })
        );
        assert_eq!(response.content, "OK");

        // content that merely resembles a status code stays intact
        for content in ["3.0.0 w00t", "2.0.0.1 w00t", "2.1.5"] {
            let line = format!("250 {content}");
            let response = ResponseBuilder::new(&ResponseLine::parse(&line).unwrap()).build(None);
            assert_eq!(response.enhanced_code, None);
            assert_eq!(response.content, content);
        }
    }

    #[test]
    fn multi_line_build() {
        let first = ResponseLine::parse("250-2.1.5 first").unwrap();
        let mut builder = ResponseBuilder::new(&first);
        builder
            .add_line(&ResponseLine::parse("250 2.1.5 second").unwrap())
            .unwrap();
        let response = builder.build(None);
        assert_eq!(response.code, 250);
        assert_eq!(
            response.enhanced_code,
            Some(EnhancedStatusCode {
                class: 2,
                subject: 1,
                detail: 5
            })
        );
        assert_eq!(response.content, "first\nsecond");
        assert_eq!(response.to_single_line(), "250 2.1.5 first second");
    }

    #[test]
    fn code_change_is_rejected() {
        let first = ResponseLine::parse("250-first").unwrap();
        let mut builder = ResponseBuilder::new(&first);
        assert!(builder
            .add_line(&ResponseLine::parse("550 second").unwrap())
            .is_err());
    }
}
