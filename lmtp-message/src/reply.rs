use std::{fmt, str};

use nom::{
    bytes::streaming::{tag, take},
    character::streaming::one_of,
    combinator::{map_opt, map_res},
    multi::many0,
    sequence::{preceded, terminated, tuple},
    IResult,
};

use crate::MaybeUtf8;

/// The three-digit basic reply code defined by RFC 5321 §4.2.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct ReplyCode {
    code: u16,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReplyCodeKind {
    PositivePreliminary,
    PositiveCompletion,
    PositiveIntermediate,
    TransientNegative,
    PermanentNegative,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReplyCodeCategory {
    Syntax,
    Information,
    Connections,
    MailSystem,
    Reserved,
}

impl ReplyCode {
    pub const SYSTEM_STATUS: ReplyCode = ReplyCode { code: 211 };
    pub const HELP_MESSAGE: ReplyCode = ReplyCode { code: 214 };
    pub const SERVICE_READY: ReplyCode = ReplyCode { code: 220 };
    pub const CLOSING_CHANNEL: ReplyCode = ReplyCode { code: 221 };
    pub const OKAY: ReplyCode = ReplyCode { code: 250 };
    pub const CANNOT_VRFY_BUT_PLEASE_TRY: ReplyCode = ReplyCode { code: 252 };
    pub const START_MAIL_INPUT: ReplyCode = ReplyCode { code: 354 };
    pub const SERVICE_NOT_AVAILABLE: ReplyCode = ReplyCode { code: 421 };
    pub const LOCAL_ERROR: ReplyCode = ReplyCode { code: 451 };
    pub const INSUFFICIENT_STORAGE: ReplyCode = ReplyCode { code: 452 };
    pub const TLS_ALREADY_ACTIVE: ReplyCode = ReplyCode { code: 443 };
    pub const TLS_NOT_AVAILABLE: ReplyCode = ReplyCode { code: 454 };
    pub const COMMAND_UNRECOGNIZED: ReplyCode = ReplyCode { code: 500 };
    pub const SYNTAX_ERROR: ReplyCode = ReplyCode { code: 501 };
    pub const COMMAND_UNIMPLEMENTED: ReplyCode = ReplyCode { code: 502 };
    pub const BAD_SEQUENCE: ReplyCode = ReplyCode { code: 503 };
    pub const MAILBOX_UNAVAILABLE: ReplyCode = ReplyCode { code: 550 };
    pub const EXCEEDED_STORAGE: ReplyCode = ReplyCode { code: 552 };
    pub const TRANSACTION_FAILED: ReplyCode = ReplyCode { code: 554 };

    pub fn custom(code: u16) -> ReplyCode {
        assert!(code < 1000, "reply codes must fit in three digits");
        ReplyCode { code }
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn category(&self) -> ReplyCodeCategory {
        match (self.code / 10) % 10 {
            0 => ReplyCodeCategory::Syntax,
            1 => ReplyCodeCategory::Information,
            2 => ReplyCodeCategory::Connections,
            5 => ReplyCodeCategory::MailSystem,
            _ => ReplyCodeCategory::Reserved,
        }
    }

    pub fn kind(&self) -> ReplyCodeKind {
        match self.code / 100 {
            1 => ReplyCodeKind::PositivePreliminary,
            2 => ReplyCodeKind::PositiveCompletion,
            3 => ReplyCodeKind::PositiveIntermediate,
            4 => ReplyCodeKind::TransientNegative,
            _ => ReplyCodeKind::PermanentNegative,
        }
    }
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:03}", self.code)
    }
}

/// The `x.y.z` enhanced status code of RFC 2034/3463, as used on almost every
/// reply in this system (`ENHANCEDSTATUSCODES` is always advertised).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum EnhancedReplyCodeClass {
    Success,
    TransientFailure,
    PermanentFailure,
}

impl EnhancedReplyCodeClass {
    fn digit(&self) -> u8 {
        match self {
            EnhancedReplyCodeClass::Success => 2,
            EnhancedReplyCodeClass::TransientFailure => 4,
            EnhancedReplyCodeClass::PermanentFailure => 5,
        }
    }

    fn from_digit(d: u8) -> Option<EnhancedReplyCodeClass> {
        match d {
            2 => Some(EnhancedReplyCodeClass::Success),
            4 => Some(EnhancedReplyCodeClass::TransientFailure),
            5 => Some(EnhancedReplyCodeClass::PermanentFailure),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum EnhancedReplyCodeSubject {
    Undefined,
    Addressing,
    Mailbox,
    MailSystem,
    Network,
    MailDelivery,
    Content,
    Policy,
}

impl EnhancedReplyCodeSubject {
    fn digit(&self) -> u8 {
        match self {
            EnhancedReplyCodeSubject::Undefined => 0,
            EnhancedReplyCodeSubject::Addressing => 1,
            EnhancedReplyCodeSubject::Mailbox => 2,
            EnhancedReplyCodeSubject::MailSystem => 3,
            EnhancedReplyCodeSubject::Network => 4,
            EnhancedReplyCodeSubject::MailDelivery => 5,
            EnhancedReplyCodeSubject::Content => 6,
            EnhancedReplyCodeSubject::Policy => 7,
        }
    }

    fn from_digit(d: u8) -> Option<EnhancedReplyCodeSubject> {
        Some(match d {
            0 => EnhancedReplyCodeSubject::Undefined,
            1 => EnhancedReplyCodeSubject::Addressing,
            2 => EnhancedReplyCodeSubject::Mailbox,
            3 => EnhancedReplyCodeSubject::MailSystem,
            4 => EnhancedReplyCodeSubject::Network,
            5 => EnhancedReplyCodeSubject::MailDelivery,
            6 => EnhancedReplyCodeSubject::Content,
            7 => EnhancedReplyCodeSubject::Policy,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct EnhancedReplyCode {
    class: EnhancedReplyCodeClass,
    subject: EnhancedReplyCodeSubject,
    detail: u16,
}

#[cfg_attr(test, allow(dead_code))]
impl EnhancedReplyCode {
    pub const SUCCESS_UNDEFINED: EnhancedReplyCode = EnhancedReplyCode {
        class: EnhancedReplyCodeClass::Success,
        subject: EnhancedReplyCodeSubject::Undefined,
        detail: 0,
    };
    pub const SUCCESS_DEST_VALID: EnhancedReplyCode = EnhancedReplyCode {
        class: EnhancedReplyCodeClass::Success,
        subject: EnhancedReplyCodeSubject::Addressing,
        detail: 5,
    };
    pub const SUCCESS_SENDER_VALID: EnhancedReplyCode = EnhancedReplyCode {
        class: EnhancedReplyCodeClass::Success,
        subject: EnhancedReplyCodeSubject::Addressing,
        detail: 0,
    };
    pub const TRANSIENT_UNDEFINED: EnhancedReplyCode = EnhancedReplyCode {
        class: EnhancedReplyCodeClass::TransientFailure,
        subject: EnhancedReplyCodeSubject::Undefined,
        detail: 0,
    };
    pub const TRANSIENT_SYSTEM_INCORRECTLY_CONFIGURED: EnhancedReplyCode = EnhancedReplyCode {
        class: EnhancedReplyCodeClass::TransientFailure,
        subject: EnhancedReplyCodeSubject::MailSystem,
        detail: 5,
    };
    /// `4.2.0`: delivery temporary failure.
    pub const TRANSIENT_DELIVERY_FAILURE: EnhancedReplyCode = EnhancedReplyCode {
        class: EnhancedReplyCodeClass::TransientFailure,
        subject: EnhancedReplyCodeSubject::Mailbox,
        detail: 0,
    };
    /// `4.2.2`: mailbox over quota, temporary.
    pub const TRANSIENT_MAILBOX_FULL: EnhancedReplyCode = EnhancedReplyCode {
        class: EnhancedReplyCodeClass::TransientFailure,
        subject: EnhancedReplyCodeSubject::Mailbox,
        detail: 2,
    };
    /// `4.3.0`: temporary internal / user lookup / class-mixing failure.
    pub const TRANSIENT_MAIL_SYSTEM: EnhancedReplyCode = EnhancedReplyCode {
        class: EnhancedReplyCodeClass::TransientFailure,
        subject: EnhancedReplyCodeSubject::MailSystem,
        detail: 0,
    };
    /// `4.7.0`: TLS not available.
    pub const TRANSIENT_POLICY: EnhancedReplyCode = EnhancedReplyCode {
        class: EnhancedReplyCodeClass::TransientFailure,
        subject: EnhancedReplyCodeSubject::Policy,
        detail: 0,
    };
    pub const PERMANENT_UNDEFINED: EnhancedReplyCode = EnhancedReplyCode {
        class: EnhancedReplyCodeClass::PermanentFailure,
        subject: EnhancedReplyCodeSubject::Undefined,
        detail: 0,
    };
    pub const PERMANENT_INVALID_COMMAND: EnhancedReplyCode = EnhancedReplyCode {
        class: EnhancedReplyCodeClass::PermanentFailure,
        subject: EnhancedReplyCodeSubject::Undefined,
        detail: 0,
    };
    /// `5.5.4`: parameter/syntax error.
    pub const PERMANENT_BAD_SYNTAX: EnhancedReplyCode = EnhancedReplyCode {
        class: EnhancedReplyCodeClass::PermanentFailure,
        subject: EnhancedReplyCodeSubject::MailDelivery,
        detail: 4,
    };
    /// `5.5.1`: sequence error / TLS already active / no valid recipients.
    pub const PERMANENT_SEQUENCE: EnhancedReplyCode = EnhancedReplyCode {
        class: EnhancedReplyCodeClass::PermanentFailure,
        subject: EnhancedReplyCodeSubject::MailDelivery,
        detail: 1,
    };
    /// `5.1.1`: user unknown.
    pub const PERMANENT_MAILBOX_UNAVAILABLE: EnhancedReplyCode = EnhancedReplyCode {
        class: EnhancedReplyCodeClass::PermanentFailure,
        subject: EnhancedReplyCodeSubject::Addressing,
        detail: 1,
    };
    /// `5.2.2`: mailbox over quota, permanent.
    pub const PERMANENT_MAILBOX_FULL: EnhancedReplyCode = EnhancedReplyCode {
        class: EnhancedReplyCodeClass::PermanentFailure,
        subject: EnhancedReplyCodeSubject::Mailbox,
        detail: 2,
    };
    /// `5.4.6`: proxy loop / TTL exhausted.
    pub const PERMANENT_ROUTING_LOOP: EnhancedReplyCode = EnhancedReplyCode {
        class: EnhancedReplyCodeClass::PermanentFailure,
        subject: EnhancedReplyCodeSubject::Network,
        detail: 6,
    };

    pub fn new(class: EnhancedReplyCodeClass, subject: EnhancedReplyCodeSubject, detail: u16) -> EnhancedReplyCode {
        EnhancedReplyCode { class, subject, detail }
    }

    pub fn class(&self) -> EnhancedReplyCodeClass {
        self.class
    }

    pub fn subject(&self) -> EnhancedReplyCodeSubject {
        self.subject
    }

    pub fn detail(&self) -> u16 {
        self.detail
    }

    fn parse(input: &[u8]) -> IResult<&[u8], EnhancedReplyCode> {
        map_opt(
            tuple((
                map_res(take(1usize), |b: &[u8]| str::from_utf8(b)),
                preceded(tag("."), map_res(take_while_digit, |b: &[u8]| str::from_utf8(b))),
                preceded(tag("."), map_res(take_while_digit, |b: &[u8]| str::from_utf8(b))),
            )),
            |(class, subject, detail)| {
                let class = EnhancedReplyCodeClass::from_digit(class.parse().ok()?)?;
                let subject = EnhancedReplyCodeSubject::from_digit(subject.parse().ok()?)?;
                let detail = detail.parse().ok()?;
                Some(EnhancedReplyCode { class, subject, detail })
            },
        )(input)
    }
}

fn take_while_digit(input: &[u8]) -> IResult<&[u8], &[u8]> {
    nom::bytes::streaming::take_while1(|b: u8| b.is_ascii_digit())(input)
}

impl fmt::Display for EnhancedReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}.{}", self.class.digit(), self.subject.digit(), self.detail)
    }
}

/// A single reply as understood by the protocol, made of a basic code, an
/// optional enhanced status code, and one or more lines of free-form text
/// (multiple lines are joined with `250-`/`250 ` continuations on the wire).
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct Reply<S = String> {
    pub code: ReplyCode,
    pub ecode: Option<EnhancedReplyCode>,
    pub text: Vec<MaybeUtf8<S>>,
}

impl<S> Reply<S>
where
    S: AsRef<str>,
{
    /// Renders this reply to its wire form, as a sequence of CRLF-terminated
    /// lines (`250-...` for all but the last, `250 ...` for the last).
    pub fn render(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, line) in self.text.iter().enumerate() {
            let is_last = i + 1 == self.text.len();
            out.extend_from_slice(format!("{}", self.code).as_bytes());
            out.push(if is_last { b' ' } else { b'-' });
            if is_last {
                if let Some(ref ecode) = self.ecode {
                    out.extend_from_slice(ecode.to_string().as_bytes());
                    out.push(b' ');
                }
            }
            out.extend_from_slice(line.as_str().as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out
    }

    /// Writes this reply's wire form to `w` and flushes it.
    pub async fn send_to<W>(&self, w: &mut W) -> std::io::Result<()>
    where
        W: futures::io::AsyncWrite + Unpin,
    {
        use futures::io::AsyncWriteExt;
        w.write_all(&self.render()).await?;
        w.flush().await
    }
}

impl Reply<&str> {
    pub fn into_owned(self) -> Reply<String> {
        Reply {
            code: self.code,
            ecode: self.ecode,
            text: self.text.iter().map(|l| l.to_owned()).collect(),
        }
    }
}

impl<S> fmt::Display for Reply<S>
where
    S: AsRef<str>,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.code)?;
        if let Some(ref ecode) = self.ecode {
            write!(f, " {}", ecode)?;
        }
        for (i, line) in self.text.iter().enumerate() {
            if i > 0 {
                write!(f, " / ")?;
            }
            write!(f, "{}", line.as_str())?;
        }
        Ok(())
    }
}

/// Parses a single reply *line* off the wire (one line of a possibly
/// multi-line reply). `Reply::parse` below folds consecutive `-`-continued
/// lines into one `Reply`.
fn reply_line(input: &[u8]) -> IResult<&[u8], (ReplyCode, bool, &[u8])> {
    let (input, code) = map_res(take(3usize), |b: &[u8]| {
        str::from_utf8(b)
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
            .filter(|c| *c < 1000)
    })(input)?;
    let (input, sep) = one_of("- ")(input)?;
    let (input, line) = terminated(
        nom::bytes::streaming::take_until("\r\n"),
        tag("\r\n"),
    )(input)?;
    Ok((input, (ReplyCode::custom(code), sep == ' ', line)))
}

impl<'a> Reply<&'a str> {
    /// Parses as many reply lines as are needed to reach a non-continued
    /// (`' '`-separated) final line, folding them into a single `Reply`.
    pub fn parse(input: &'a [u8]) -> IResult<&'a [u8], Reply<&'a str>> {
        let (input, mut lines) = many0(peek_continued_line)(input)?;
        let (input, (code, _is_last, last_line)) = reply_line(input)?;
        let last = str::from_utf8(last_line)
            .map_err(|_| nom::Err::Failure(nom::error::Error::new(input, nom::error::ErrorKind::Char)))?;
        lines.push(last);
        // The enhanced status code, if present, is only parsed off the
        // *last* line and shared for the whole reply.
        let (ecode, texts) = split_ecode(lines);
        Ok((
            input,
            Reply {
                code,
                ecode,
                text: texts.into_iter().map(MaybeUtf8::from).collect(),
            },
        ))
    }
}

fn peek_continued_line(input: &[u8]) -> IResult<&[u8], &str> {
    let (rest, (_code, is_last, line)) = reply_line(input)?;
    if is_last {
        return Err(nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Verify)));
    }
    let line = str::from_utf8(line)
        .map_err(|_| nom::Err::Failure(nom::error::Error::new(input, nom::error::ErrorKind::Char)))?;
    Ok((rest, line))
}

fn split_ecode(lines: Vec<&str>) -> (Option<EnhancedReplyCode>, Vec<&str>) {
    let mut out = Vec::with_capacity(lines.len());
    let mut ecode = None;
    for (i, line) in lines.iter().enumerate() {
        if i == lines.len() - 1 {
            if let Ok((rest, parsed)) = EnhancedReplyCode::parse(line.as_bytes()) {
                if rest.first() == Some(&b' ') {
                    ecode = Some(parsed);
                    out.push(str::from_utf8(&rest[1..]).unwrap_or(""));
                    continue;
                }
            }
        }
        out.push(*line);
    }
    (ecode, out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_code_kind() {
        assert_eq!(ReplyCode::OKAY.kind(), ReplyCodeKind::PositiveCompletion);
        assert_eq!(ReplyCode::LOCAL_ERROR.kind(), ReplyCodeKind::TransientNegative);
        assert_eq!(ReplyCode::MAILBOX_UNAVAILABLE.kind(), ReplyCodeKind::PermanentNegative);
    }

    #[test]
    fn enhanced_code_display() {
        assert_eq!(EnhancedReplyCode::SUCCESS_DEST_VALID.to_string(), "2.1.5");
        assert_eq!(
            EnhancedReplyCode::TRANSIENT_SYSTEM_INCORRECTLY_CONFIGURED.to_string(),
            "4.3.5"
        );
    }

    #[test]
    fn parse_single_line() {
        let (rem, r) = Reply::<&str>::parse(b"250 2.1.5 OK\r\n").unwrap();
        assert!(rem.is_empty());
        assert_eq!(r.code, ReplyCode::OKAY);
        assert_eq!(r.ecode, Some(EnhancedReplyCode::SUCCESS_DEST_VALID));
        assert_eq!(r.text, vec![MaybeUtf8::from("OK")]);
    }

    #[test]
    fn parse_multiline() {
        let (rem, r) = Reply::<&str>::parse(b"250-first\r\n250-second\r\n250 2.0.0 OK\r\n").unwrap();
        assert!(rem.is_empty());
        assert_eq!(r.text.len(), 3);
        assert_eq!(r.ecode, Some(EnhancedReplyCode::SUCCESS_UNDEFINED));
    }

    #[test]
    fn render_roundtrip() {
        let r = Reply {
            code: ReplyCode::OKAY,
            ecode: Some(EnhancedReplyCode::SUCCESS_DEST_VALID),
            text: vec![MaybeUtf8::from("OK")],
        };
        assert_eq!(r.render(), b"250 2.1.5 OK\r\n");
    }
}
