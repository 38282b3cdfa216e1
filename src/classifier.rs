//! sshd auth log line classification
//!
//! Recognizes three shapes of sshd lines:
//! - `sshd[pid]: Failed <method> for <user> from <addr> port <port> ...`
//! - `sshd[pid]: message repeated N times: [ Failed <method> for ... ]`
//! - `sshd[pid]: last message repeated N times`
//!
//! Matching is plain substring search, case-sensitive, in that order. The
//! last shape carries no address; [`ClassifierContext`] attaches it to the
//! address of the line before.

/// Process tag every relevant line carries.
pub const SERVICE_TAG: &str = " sshd[";

const FAILED: &str = ": Failed ";
const MESSAGE_REPEATED: &str = ": message repeated ";
const REPEATED_FAILED: &str = " times: [ Failed ";
const LAST_REPEATED: &str = ": last message repeated ";
const TIMES: &str = " times";
const FOR: &str = " for ";
const FROM: &str = " from ";
const PORT: &str = " port ";

/// Result of classifying a single line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    /// One or more failed authentications from `address`.
    Failure { address: String, repeat_count: u64 },
    /// Repeat count for whatever address the previous line named.
    Continuation { repeat_count: u64 },
    NoEvent,
}

/// Failure count to apply to one address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub address: String,
    pub count: u64,
}

/// Classify one complete line (without its terminator).
pub fn classify(line: &str) -> LineEvent {
    let Some(tag) = line.find(SERVICE_TAG) else {
        return LineEvent::NoEvent;
    };
    let rest = &line[tag..];

    if let Some(pos) = rest.find(FAILED) {
        // A direct failure line never falls through to the repeat forms
        return match extract_address(&rest[pos + FAILED.len()..]) {
            Some(address) => LineEvent::Failure {
                address,
                repeat_count: 1,
            },
            None => LineEvent::NoEvent,
        };
    }

    if let Some(event) = classify_message_repeated(rest) {
        return event;
    }

    classify_last_repeated(rest).unwrap_or(LineEvent::NoEvent)
}

fn classify_message_repeated(rest: &str) -> Option<LineEvent> {
    let start = rest.find(MESSAGE_REPEATED)? + MESSAGE_REPEATED.len();
    let counted = &rest[start..];
    let method = counted.find(REPEATED_FAILED)? + REPEATED_FAILED.len();

    let repeat_count = parse_count(counted);
    if repeat_count == 0 {
        return None;
    }

    let address = extract_address(&counted[method..])?;
    Some(LineEvent::Failure {
        address,
        repeat_count,
    })
}

fn classify_last_repeated(rest: &str) -> Option<LineEvent> {
    let start = rest.find(LAST_REPEATED)? + LAST_REPEATED.len();
    let counted = &rest[start..];
    counted.find(TIMES)?;

    match parse_count(counted) {
        0 => None,
        repeat_count => Some(LineEvent::Continuation { repeat_count }),
    }
}

/// Pull the text between `" from "` and `" port "`, both after `" for "`.
fn extract_address(text: &str) -> Option<String> {
    let user = text.find(FOR)? + FOR.len();
    let after_user = &text[user..];

    let host = after_user.find(FROM)? + FROM.len();
    let host_text = &after_user[host..];

    let end = host_text.find(PORT)?;
    let address = &host_text[..end];

    if !is_accepted_address(address) {
        return None;
    }

    Some(address.to_string())
}

/// IPv6 sources always; dotted IPv4 only when built with the `ipv4` feature.
fn is_accepted_address(address: &str) -> bool {
    if address.contains(':') {
        return true;
    }

    cfg!(feature = "ipv4") && address.contains('.')
}

/// Leading base-10 digits, saturating. Anything else reads as zero.
pub fn parse_count(text: &str) -> u64 {
    let digits = text.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return 0;
    }

    text[..digits].parse().unwrap_or(u64::MAX)
}

/// Carries the last classified address between lines.
#[derive(Debug, Default, Clone)]
pub struct ClassifierContext {
    last_address: Option<String>,
}

impl ClassifierContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify `line` and resolve it against the previous line.
    pub fn observe(&mut self, line: &str) -> Option<Attempt> {
        self.resolve(classify(line))
    }

    /// Turn an event into the attempt the registry must record.
    ///
    /// Any line that is not an sshd failure breaks the chain, so a later
    /// continuation line has nothing to attach to.
    pub fn resolve(&mut self, event: LineEvent) -> Option<Attempt> {
        match event {
            LineEvent::Failure {
                address,
                repeat_count,
            } => {
                self.last_address = Some(address.clone());
                Some(Attempt {
                    address,
                    count: repeat_count,
                })
            }
            LineEvent::Continuation { repeat_count } => match &self.last_address {
                Some(address) => Some(Attempt {
                    address: address.clone(),
                    count: repeat_count,
                }),
                None => None,
            },
            LineEvent::NoEvent => {
                self.last_address = None;
                None
            }
        }
    }

    pub fn last_address(&self) -> Option<&str> {
        self.last_address.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const V6_FAILURE: &str = "Jan  5 10:00:00 host sshd[123]: Failed password for invalid user x from 2001:db8::1 port 4444 ssh2";
    const LAST_REPEATED_3: &str = "Jan  5 10:00:01 host sshd[123]: last message repeated 3 times";

    #[test]
    fn test_line_without_service_tag() {
        assert_eq!(
            classify("Jan  5 10:00:00 host cron[1]: Failed password for x from 2001:db8::1 port 1 ssh2"),
            LineEvent::NoEvent
        );
        assert_eq!(classify(""), LineEvent::NoEvent);
        assert_eq!(
            classify("Jan  5 10:00:00 host sshd: Failed password for x from 2001:db8::1 port 1"),
            LineEvent::NoEvent
        );
    }

    #[test]
    fn test_ipv6_failure() {
        assert_eq!(
            classify(V6_FAILURE),
            LineEvent::Failure {
                address: "2001:db8::1".to_string(),
                repeat_count: 1,
            }
        );
    }

    #[test]
    fn test_publickey_failure() {
        let line = "Jan  5 10:00:00 host sshd[9]: Failed publickey for root from fe80::2 port 22 ssh2: RSA SHA256:abc";
        assert_eq!(
            classify(line),
            LineEvent::Failure {
                address: "fe80::2".to_string(),
                repeat_count: 1,
            }
        );
    }

    #[cfg(feature = "ipv4")]
    #[test]
    fn test_message_repeated_ipv4() {
        let line = "Jan  5 10:00:00 host sshd[123]: message repeated 7 times: [ Failed password for x from 10.0.0.5 port 22 ssh2 ]";
        assert_eq!(
            classify(line),
            LineEvent::Failure {
                address: "10.0.0.5".to_string(),
                repeat_count: 7,
            }
        );
    }

    #[cfg(not(feature = "ipv4"))]
    #[test]
    fn test_ipv4_rejected_without_feature() {
        let line = "Jan  5 10:00:00 host sshd[123]: Failed password for x from 10.0.0.5 port 22 ssh2";
        assert_eq!(classify(line), LineEvent::NoEvent);
    }

    #[test]
    fn test_message_repeated_ipv6() {
        let line = "Jan  5 10:00:00 host sshd[123]: message repeated 2 times: [ Failed password for root from 2001:db8::7 port 22 ssh2]";
        assert_eq!(
            classify(line),
            LineEvent::Failure {
                address: "2001:db8::7".to_string(),
                repeat_count: 2,
            }
        );
    }

    #[test]
    fn test_message_repeated_zero_is_not_an_event() {
        let line = "Jan  5 10:00:00 host sshd[123]: message repeated 0 times: [ Failed password for root from 2001:db8::7 port 22 ssh2]";
        assert_eq!(classify(line), LineEvent::NoEvent);

        let line = "Jan  5 10:00:00 host sshd[123]: message repeated many times: [ Failed password for root from 2001:db8::7 port 22 ssh2]";
        assert_eq!(classify(line), LineEvent::NoEvent);
    }

    #[test]
    fn test_last_message_repeated() {
        assert_eq!(
            classify(LAST_REPEATED_3),
            LineEvent::Continuation { repeat_count: 3 }
        );
        // Needs the trailing " times"
        assert_eq!(
            classify("Jan  5 10:00:01 host sshd[123]: last message repeated 3"),
            LineEvent::NoEvent
        );
    }

    #[test]
    fn test_hostname_without_address_marker_rejected() {
        let line = "Jan  5 10:00:00 host sshd[123]: Failed password for root from attacker port 22 ssh2";
        assert_eq!(classify(line), LineEvent::NoEvent);
    }

    #[test]
    fn test_missing_markers() {
        for line in [
            "host sshd[1]: Failed password root from 2001:db8::1 port 22",
            "host sshd[1]: Failed password for root 2001:db8::1 port 22",
            "host sshd[1]: Failed password for root from 2001:db8::1",
            "host sshd[1]: Accepted password for root from 2001:db8::1 port 22 ssh2",
        ] {
            assert_eq!(classify(line), LineEvent::NoEvent, "{line}");
        }
    }

    #[test]
    fn test_colon_after_port_does_not_qualify() {
        // The only colon is in the trailing key fingerprint
        let line = "host sshd[1]: Failed publickey for root from somehost port 22 ssh2: RSA SHA256:abc";
        assert_eq!(classify(line), LineEvent::NoEvent);
    }

    #[test]
    fn test_parse_count() {
        assert_eq!(parse_count("12 times"), 12);
        assert_eq!(parse_count("7"), 7);
        assert_eq!(parse_count("x7"), 0);
        assert_eq!(parse_count("-3 times"), 0);
        assert_eq!(parse_count(""), 0);
        assert_eq!(parse_count("99999999999999999999999 times"), u64::MAX);
    }

    #[test]
    fn test_continuation_uses_previous_address() {
        let mut ctx = ClassifierContext::new();

        let first = ctx.observe(V6_FAILURE).unwrap();
        assert_eq!(first.address, "2001:db8::1");
        assert_eq!(first.count, 1);

        let repeated = ctx.observe(LAST_REPEATED_3).unwrap();
        assert_eq!(repeated.address, "2001:db8::1");
        assert_eq!(repeated.count, 3);

        // Continuations chain
        assert!(ctx.observe(LAST_REPEATED_3).is_some());
        assert_eq!(ctx.last_address(), Some("2001:db8::1"));
    }

    #[test]
    fn test_continuation_without_previous_address() {
        let mut ctx = ClassifierContext::new();
        assert_eq!(ctx.observe(LAST_REPEATED_3), None);
        assert_eq!(ctx.last_address(), None);
    }

    #[test]
    fn test_unrelated_line_breaks_chain() {
        let mut ctx = ClassifierContext::new();
        ctx.observe(V6_FAILURE);
        assert_eq!(
            ctx.observe("Jan  5 10:00:00 host CRON[5]: pam_unix(cron:session): session opened"),
            None
        );
        assert_eq!(ctx.observe(LAST_REPEATED_3), None);
    }
}
