use crate::backends::HdrDeliveryAddress;
use crate::lmtp_server::Recipient;
use chrono::{DateTime, Utc};
use rfc2033::SmtpAddress;
use std::net::IpAddr;

pub struct TraceHeaderInput<'a> {
    pub local_rcpts: &'a [&'a Recipient],
    pub sender: &'a SmtpAddress,
    pub greeting_name: &'a str,
    pub remote_ip: Option<IpAddr>,
    pub tls_cipher: Option<&'a str>,
    pub my_hostname: &'a str,
    pub session_id: &'a str,
    pub now: DateTime<Utc>,
}

/// Compose the header block prepended to the body stream handed to
/// delivery. Return-Path is only added for local recipients; a proxied
/// message gets it from the final destination server, and adding it
/// here would duplicate it.
pub fn compose_added_headers(input: &TraceHeaderInput) -> String {
    let mut out = String::with_capacity(200);

    let delivered_to: Option<SmtpAddress> = match input.local_rcpts {
        [rcpt] => {
            let policy = rcpt
                .user
                .as_ref()
                .map(|user| user.hdr_delivery_address)
                .unwrap_or_default();
            match policy {
                HdrDeliveryAddress::None => None,
                HdrDeliveryAddress::Final => Some(rcpt.address.clone()),
                HdrDeliveryAddress::Original => Some(
                    rcpt.params
                        .orcpt
                        .clone()
                        .unwrap_or_else(|| rcpt.address.clone()),
                ),
            }
        }
        _ => None,
    };

    if !input.local_rcpts.is_empty() {
        out.push_str(&format!("Return-Path: <{}>\r\n", input.sender.encode()));
        if let Some(rcpt_to) = &delivered_to {
            out.push_str(&format!("Delivered-To: {}\r\n", rcpt_to.encode()));
        }
    }

    out.push_str(&format!("Received: from {}", input.greeting_name));
    if let Some(ip) = input.remote_ip {
        out.push_str(&format!(" ([{ip}])"));
    }
    out.push_str("\r\n");
    if let Some(cipher) = input.tls_cipher {
        out.push_str(&format!("\t(using {cipher})\r\n"));
    }
    out.push_str(&format!(
        "\tby {} with LMTP id {}",
        input.my_hostname, input.session_id
    ));

    out.push_str("\r\n\t");
    if let Some(rcpt_to) = &delivered_to {
        out.push_str(&format!("for <{}>", rcpt_to.encode()));
    }
    out.push_str(&format!("; {}\r\n", input.now.to_rfc2822()));
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backends::StorageUser;
    use crate::lmtp_server::Routing;
    use chrono::TimeZone;
    use rfc2033::{Domain, RcptParams};
    use std::sync::Arc;

    fn rcpt(local: &str, policy: HdrDeliveryAddress) -> Recipient {
        Recipient {
            address: SmtpAddress {
                local_part: local.to_string(),
                domain: Some(Domain::Name("example.com".to_string())),
            },
            detail: String::new(),
            params: RcptParams::default(),
            session_id: "sid1".to_string(),
            routing: Routing::Local,
            user: Some(Arc::new(StorageUser {
                username: local.to_string(),
                uid: None,
                hdr_delivery_address: policy,
            })),
        }
    }

    fn input<'a>(
        rcpts: &'a [&'a Recipient],
        sender: &'a SmtpAddress,
        tls: Option<&'a str>,
    ) -> TraceHeaderInput<'a> {
        TraceHeaderInput {
            local_rcpts: rcpts,
            sender,
            greeting_name: "client.example.com",
            remote_ip: Some("10.0.0.5".parse().unwrap()),
            tls_cipher: tls,
            my_hostname: "mx.example.com",
            session_id: "sid1",
            now: Utc.with_ymd_and_hms(2017, 3, 4, 5, 6, 7).unwrap(),
        }
    }

    #[test]
    fn single_local_recipient() {
        let sender = SmtpAddress {
            local_part: "s".to_string(),
            domain: Some(Domain::Name("x".to_string())),
        };
        let rcpt = rcpt("u", HdrDeliveryAddress::Final);
        let rcpts = [&rcpt];
        let headers = compose_added_headers(&input(&rcpts, &sender, None));
        assert_eq!(
            headers,
            "Return-Path: <s@x>\r\n\
             Delivered-To: u@example.com\r\n\
             Received: from client.example.com ([10.0.0.5])\r\n\
             \tby mx.example.com with LMTP id sid1\r\n\
             \tfor <u@example.com>; Sat, 4 Mar 2017 05:06:07 +0000\r\n"
        );
    }

    #[test]
    fn delivery_address_policies() {
        let sender = SmtpAddress::null();

        let rcpt_none = rcpt("u", HdrDeliveryAddress::None);
        let rcpts = [&rcpt_none];
        let headers = compose_added_headers(&input(&rcpts, &sender, None));
        assert!(!headers.contains("Delivered-To:"));
        assert!(headers.starts_with("Return-Path: <>\r\n"));

        let mut rcpt_orig = rcpt("u", HdrDeliveryAddress::Original);
        rcpt_orig.params =
            RcptParams::parse("ORCPT=rfc822;original@example.com").unwrap();
        let rcpts = [&rcpt_orig];
        let headers = compose_added_headers(&input(&rcpts, &sender, None));
        assert!(headers.contains("Delivered-To: original@example.com\r\n"));
        assert!(headers.contains("for <original@example.com>;"));
    }

    #[test]
    fn multiple_recipients_get_no_delivered_to() {
        let sender = SmtpAddress::null();
        let one = rcpt("a", HdrDeliveryAddress::Final);
        let two = rcpt("b", HdrDeliveryAddress::Final);
        let rcpts = [&one, &two];
        let headers = compose_added_headers(&input(&rcpts, &sender, None));
        assert!(!headers.contains("Delivered-To:"));
        assert!(headers.contains("\t; Sat,"));
    }

    #[test]
    fn proxy_only_skips_return_path() {
        let sender = SmtpAddress::null();
        let rcpts: [&Recipient; 0] = [];
        let headers = compose_added_headers(&input(&rcpts, &sender, Some("TLSv1_3 cipher")));
        assert!(!headers.contains("Return-Path:"));
        assert!(headers.starts_with("Received: from client.example.com"));
        assert!(headers.contains("\t(using TLSv1_3 cipher)\r\n"));
    }
}
