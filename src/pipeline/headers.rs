//! Envelope recovery from a decrypted message's header block.
//!
//! SES hands us the message exactly as it arrived, so the SMTP envelope is
//! gone. We rebuild it from headers:
//! - envelope sender ← the single `From` mailbox
//! - envelope recipients ← `To` addresses inside the serviced domain, or the
//!   `for <...>` clause of the topmost `Received` header when `To` has none
//!   (BCC, mailing lists, malformed `To`)

use std::fmt;

use mail_parser::{Address, Message, MessageParser};
use regex::Regex;

use crate::error::{ConfigError, ExtractError};

/// Header SES stamps with its anti-malware result.
pub const VIRUS_VERDICT_HEADER: &str = "X-SES-Virus-Verdict";

/// Upstream virus scan result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VirusVerdict {
    /// No verdict header.
    #[default]
    Absent,
    /// Any verdict other than `FAIL` (PASS, GRAY, PROCESSING_FAILED, ...).
    Pass,
    /// The scan flagged the message.
    Fail,
}

impl VirusVerdict {
    /// Interpret a raw header value.
    pub fn from_header(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            None => Self::Absent,
            Some(v) if v.eq_ignore_ascii_case("FAIL") => Self::Fail,
            Some(_) => Self::Pass,
        }
    }

    pub fn is_fail(self) -> bool {
        self == Self::Fail
    }
}

impl fmt::Display for VirusVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Absent => "absent",
            Self::Pass => "pass",
            Self::Fail => "fail",
        })
    }
}

/// Envelope and trust signal recovered from a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedHeaders {
    /// Envelope sender (bare address from `From`).
    pub from: String,
    /// Envelope recipients: unique, lower-cased, inside the serviced domain.
    pub recipients: Vec<String>,
    pub verdict: VirusVerdict,
}

/// Extracts envelope data for one serviced domain.
#[derive(Debug, Clone)]
pub struct HeaderExtractor {
    domain: String,
    received_for: Regex,
}

impl HeaderExtractor {
    /// Build an extractor for `domain` (matched case-insensitively).
    pub fn new(domain: &str) -> Result<Self, ConfigError> {
        let domain = domain.trim().to_lowercase();
        if domain.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "mail.domain".into(),
                message: "serviced domain must not be empty".into(),
            });
        }

        let pattern = format!(
            r"(?i)\bfor\s+<?([^\s<>@;]+@{})(?:[\s>;]|$)",
            regex::escape(&domain)
        );
        let received_for = Regex::new(&pattern).map_err(|e| ConfigError::InvalidValue {
            key: "mail.domain".into(),
            message: e.to_string(),
        })?;

        Ok(Self {
            domain,
            received_for,
        })
    }

    /// The serviced domain, lower-cased.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Recover sender, recipients and virus verdict from a raw message.
    pub fn extract(&self, payload: &[u8]) -> Result<ExtractedHeaders, ExtractError> {
        let message = MessageParser::default()
            .parse(payload)
            .filter(|m| !m.headers().is_empty())
            .ok_or(ExtractError::MalformedMessage)?;

        let verdict = VirusVerdict::from_header(raw_header(&message, VIRUS_VERDICT_HEADER).as_deref());

        let from = sender(&message).map_err(|reason| ExtractError::InvalidSender { reason, verdict })?;

        let mut recipients = Vec::new();
        for address in addresses(message.to()) {
            let address = address.to_lowercase();
            if self.in_domain(&address) && !recipients.contains(&address) {
                recipients.push(address);
            }
        }

        if recipients.is_empty() {
            // The topmost Received header is the one SES added on arrival.
            if let Some(address) = raw_header(&message, "Received")
                .and_then(|received| self.received_recipient(&received))
            {
                recipients.push(address);
            }
        }

        if recipients.is_empty() {
            return Err(ExtractError::NoRecipients {
                domain: self.domain.clone(),
                verdict,
            });
        }

        Ok(ExtractedHeaders {
            from,
            recipients,
            verdict,
        })
    }

    fn in_domain(&self, address: &str) -> bool {
        address
            .rsplit_once('@')
            .is_some_and(|(_, host)| host.contains(&self.domain))
    }

    fn received_recipient(&self, received: &str) -> Option<String> {
        self.received_for
            .captures(received)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_lowercase())
    }
}

/// The single `From` mailbox, validated as an SMTP address.
fn sender(message: &Message<'_>) -> Result<String, String> {
    let found = addresses(message.from());
    let address = match found.as_slice() {
        [] => return Err("no mailbox in From header".into()),
        [one] => one,
        many => return Err(format!("expected one mailbox, found {}", many.len())),
    };

    address
        .parse::<lettre::Address>()
        .map(|_| address.clone())
        .map_err(|e| format!("{address}: {e}"))
}

/// Flatten an address header, groups included, to bare addresses.
fn addresses(addr: Option<&Address<'_>>) -> Vec<String> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    match addr {
        Address::List(list) => list
            .iter()
            .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            .collect(),
        Address::Group(groups) => groups
            .iter()
            .flat_map(|g| {
                g.addresses
                    .iter()
                    .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            })
            .collect(),
    }
}

/// Unparsed value of the first header named `name`.
fn raw_header(message: &Message<'_>, name: &str) -> Option<String> {
    let header = message
        .headers()
        .iter()
        .find(|h| h.name().eq_ignore_ascii_case(name))?;
    let raw = message
        .raw_message()
        .get(header.offset_start as usize..header.offset_end as usize)?;
    Some(String::from_utf8_lossy(raw).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> HeaderExtractor {
        HeaderExtractor::new("corp.example").unwrap()
    }

    #[test]
    fn mixed_domains_keep_only_serviced_recipients() {
        let msg = b"From: a@x.com\r\nTo: b@corp.example, c@other.com\r\nSubject: hi\r\n\r\nbody\r\n";
        let headers = extractor().extract(msg).unwrap();
        assert_eq!(headers.from, "a@x.com");
        assert_eq!(headers.recipients, vec!["b@corp.example"]);
        assert_eq!(headers.verdict, VirusVerdict::Absent);
    }

    #[test]
    fn missing_to_falls_back_to_received() {
        let msg = b"Received: from mail.x.com by inbound-smtp.amazonaws.com with SMTP id abc for <d@corp.example>; Mon, 1 Jan 2024 00:00:00 +0000\r\n\
From: a@x.com\r\nSubject: bcc\r\n\r\nbody\r\n";
        let headers = extractor().extract(msg).unwrap();
        assert_eq!(headers.recipients, vec!["d@corp.example"]);
    }

    #[test]
    fn out_of_domain_to_falls_back_to_received() {
        let msg = b"Received: from list.example by ses with SMTP id 1 for List@Corp.Example; Tue, 2 Jan 2024 00:00:00 +0000\r\n\
From: \"List\" <owner@lists.example>\r\nTo: everyone@lists.example\r\n\r\nbody\r\n";
        let headers = extractor().extract(msg).unwrap();
        assert_eq!(headers.from, "owner@lists.example");
        assert_eq!(headers.recipients, vec!["list@corp.example"]);
    }

    #[test]
    fn folded_received_header_is_scanned() {
        let msg = b"Received: from mail.x.com\r\n by inbound-smtp.amazonaws.com with SMTP id abc\r\n for <e@corp.example>;\r\n Mon, 1 Jan 2024 00:00:00 +0000\r\n\
From: a@x.com\r\n\r\nbody\r\n";
        let headers = extractor().extract(msg).unwrap();
        assert_eq!(headers.recipients, vec!["e@corp.example"]);
    }

    #[test]
    fn only_first_received_header_is_used() {
        let msg = b"Received: from relay by ses with SMTP id 2\r\n\
Received: from origin by relay for <f@corp.example>; Mon, 1 Jan 2024 00:00:00 +0000\r\n\
From: a@x.com\r\n\r\nbody\r\n";
        let err = extractor().extract(msg).unwrap_err();
        assert!(matches!(err, ExtractError::NoRecipients { .. }));
    }

    #[test]
    fn received_for_other_domain_is_ignored() {
        let msg = b"Received: from x by ses for <g@corp.example.evil.com>; Mon, 1 Jan 2024 00:00:00 +0000\r\n\
From: a@x.com\r\n\r\nbody\r\n";
        assert!(matches!(
            extractor().extract(msg),
            Err(ExtractError::NoRecipients { .. })
        ));
    }

    #[test]
    fn recipients_lowercased_ordered_and_unique() {
        let msg = b"From: a@x.com\r\nTo: Zed@Corp.Example, out@gmail.com, amy@corp.example, ZED@corp.example\r\n\r\nbody\r\n";
        let headers = extractor().extract(msg).unwrap();
        assert_eq!(headers.recipients, vec!["zed@corp.example", "amy@corp.example"]);
        assert!(headers.recipients.iter().all(|r| r.ends_with("@corp.example")));
    }

    #[test]
    fn subdomains_of_serviced_domain_match() {
        let msg = b"From: a@x.com\r\nTo: ops@mail.corp.example\r\n\r\nbody\r\n";
        let headers = extractor().extract(msg).unwrap();
        assert_eq!(headers.recipients, vec!["ops@mail.corp.example"]);
    }

    #[test]
    fn local_part_containing_domain_does_not_match() {
        let msg = b"From: a@x.com\r\nTo: \"corp.example\"@other.com\r\n\r\nbody\r\n";
        assert!(matches!(
            extractor().extract(msg),
            Err(ExtractError::NoRecipients { .. })
        ));
    }

    #[test]
    fn group_addresses_are_flattened() {
        let msg = b"From: a@x.com\r\nTo: Team: one@corp.example, two@other.com;\r\n\r\nbody\r\n";
        let headers = extractor().extract(msg).unwrap();
        assert_eq!(headers.recipients, vec!["one@corp.example"]);
    }

    #[test]
    fn display_name_sender_is_stripped() {
        let msg = b"From: Alice Example <Alice@X.com>\r\nTo: b@corp.example\r\n\r\nbody\r\n";
        let headers = extractor().extract(msg).unwrap();
        assert_eq!(headers.from, "Alice@X.com");
    }

    #[test]
    fn missing_from_is_invalid_sender() {
        let msg = b"To: b@corp.example\r\nSubject: anon\r\n\r\nbody\r\n";
        assert!(matches!(
            extractor().extract(msg),
            Err(ExtractError::InvalidSender { .. })
        ));
    }

    #[test]
    fn multiple_from_mailboxes_is_invalid_sender() {
        let msg = b"From: a@x.com, b@y.com\r\nTo: b@corp.example\r\n\r\nbody\r\n";
        assert!(matches!(
            extractor().extract(msg),
            Err(ExtractError::InvalidSender { .. })
        ));
    }

    #[test]
    fn no_recipients_anywhere() {
        let msg = b"From: a@x.com\r\nTo: b@other.com\r\n\r\nbody\r\n";
        let err = extractor().extract(msg).unwrap_err();
        assert_eq!(
            err,
            ExtractError::NoRecipients {
                domain: "corp.example".into(),
                verdict: VirusVerdict::Absent,
            }
        );
    }

    #[test]
    fn empty_payload_is_malformed() {
        assert_eq!(
            extractor().extract(b"").unwrap_err(),
            ExtractError::MalformedMessage
        );
    }

    #[test]
    fn virus_verdict_values() {
        assert_eq!(VirusVerdict::from_header(None), VirusVerdict::Absent);
        assert_eq!(VirusVerdict::from_header(Some("PASS")), VirusVerdict::Pass);
        assert_eq!(VirusVerdict::from_header(Some("GRAY")), VirusVerdict::Pass);
        assert_eq!(VirusVerdict::from_header(Some(" FAIL ")), VirusVerdict::Fail);
        assert_eq!(VirusVerdict::from_header(Some("fail")), VirusVerdict::Fail);
    }

    #[test]
    fn virus_verdict_read_from_headers() {
        let msg = b"X-SES-Virus-Verdict: FAIL\r\nFrom: a@x.com\r\nTo: b@corp.example\r\n\r\nbody\r\n";
        let headers = extractor().extract(msg).unwrap();
        assert!(headers.verdict.is_fail());
    }

    #[test]
    fn verdict_survives_extraction_failure() {
        let msg = b"X-SES-Virus-Verdict: FAIL\r\nFrom: a@x.com\r\nTo: b@other.com\r\n\r\nbody\r\n";
        let err = extractor().extract(msg).unwrap_err();
        assert_eq!(err.verdict(), VirusVerdict::Fail);
    }

    #[test]
    fn extraction_is_idempotent() {
        let msg = b"X-SES-Virus-Verdict: PASS\r\nFrom: a@x.com\r\nTo: B@corp.example, c@corp.example\r\n\r\nbody\r\n";
        let ex = extractor();
        assert_eq!(ex.extract(msg).unwrap(), ex.extract(msg).unwrap());
    }

    #[test]
    fn empty_domain_is_rejected() {
        assert!(HeaderExtractor::new("  ").is_err());
    }
}
