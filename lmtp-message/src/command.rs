use std::io::IoSlice;

use nom::{
    branch::alt,
    bytes::streaming::{tag, tag_no_case, take_while1},
    character::streaming::space0,
    combinator::{map, map_opt, opt, value},
    multi::many0,
    sequence::{preceded, terminated, tuple},
    IResult,
};

use crate::{Email, Hostname, MaybeUtf8, Path};

/// A single `KEY` or `KEY=VALUE` ESMTP parameter, as appears after `MAIL
/// FROM:<...>` / `RCPT TO:<...>` (`SIZE=1234`, `BODY=8BITMIME`, ...).
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct ParameterName<S = String>(pub S);

impl<S> ParameterName<S>
where
    S: AsRef<str>,
{
    pub fn as_str(&self) -> &str {
        self.0.as_ref()
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct Parameters<S = String>(pub Vec<(ParameterName<S>, Option<S>)>);

impl<S> Parameters<S> {
    pub fn get(&self, name: &str) -> Option<&Option<S>>
    where
        S: AsRef<str>,
    {
        self.0
            .iter()
            .find(|(k, _)| k.as_str().eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }
}

fn is_param_name_char(b: u8) -> bool {
    b.is_ascii_alphanumeric()
}

fn is_param_value_char(b: u8) -> bool {
    (b' '..=b'~').contains(&b) && b != b'='
}

fn parameters<'a, S>(input: &'a [u8]) -> IResult<&'a [u8], Parameters<S>>
where
    S: From<&'a str>,
{
    map(
        many0(preceded(
            tag(b" "),
            map(
                tuple((
                    map(take_while1(is_param_name_char), |b: &[u8]| {
                        S::from(unsafe { std::str::from_utf8_unchecked(b) })
                    }),
                    opt(preceded(
                        tag(b"="),
                        map(take_while1(is_param_value_char), |b: &[u8]| {
                            S::from(unsafe { std::str::from_utf8_unchecked(b) })
                        }),
                    )),
                )),
                |(name, value)| (ParameterName(name), value),
            ),
        )),
        Parameters,
    )(input)
}

/// A single LMTP/SMTP command line, generic over the string type used to
/// hold borrowed-vs-owned text (`&str` while parsing straight off the wire,
/// `String` once the command outlives the read buffer).
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum Command<S = String> {
    Ehlo {
        hostname: Hostname<S>,
    },
    Helo {
        hostname: Hostname<S>,
    },
    Mail {
        path: Option<Path<S>>,
        email: Option<Email<S>>,
        params: Parameters<S>,
    },
    Rcpt {
        path: Option<Path<S>>,
        email: Email<S>,
        params: Parameters<S>,
    },
    Data,
    Rset,
    Starttls,
    /// `XCLIENT` (not part of RFC 2033, but near-universally supported by
    /// LMTP servers sitting behind a trusted relay) lets the relay tell us
    /// the real client address/hostname it is proxying for.
    Xclient {
        params: Parameters<S>,
    },
    Expn {
        name: MaybeUtf8<S>,
    },
    Vrfy {
        name: MaybeUtf8<S>,
    },
    Help {
        subject: MaybeUtf8<S>,
    },
    Noop {
        string: MaybeUtf8<S>,
    },
    Quit,
}

impl<'a> Command<&'a str> {
    /// Parses a single command line (without the trailing `\r\n`, which
    /// callers strip off using [`next_crlf`] while framing the input).
    pub fn parse(buf: &'a [u8]) -> IResult<&'a [u8], Command<&'a str>> {
        alt((
            Self::parse_ehlo,
            Self::parse_helo,
            Self::parse_mail,
            Self::parse_rcpt,
            Self::parse_data,
            Self::parse_rset,
            Self::parse_starttls,
            Self::parse_xclient,
            Self::parse_expn,
            Self::parse_vrfy,
            Self::parse_help,
            Self::parse_noop,
            Self::parse_quit,
        ))(buf)
    }

    fn parse_ehlo(buf: &'a [u8]) -> IResult<&'a [u8], Command<&'a str>> {
        // LMTP (RFC 2033) greets with `LHLO` where SMTP uses `EHLO`; both
        // carry the same extended-hello semantics, so they parse to the
        // same `Command::Ehlo`.
        map(
            preceded(
                tuple((
                    alt((tag_no_case(b"EHLO"), tag_no_case(b"LHLO"))),
                    tag(b" "),
                    space0,
                )),
                Hostname::parse_until(b"\r"),
            ),
            |hostname| Command::Ehlo { hostname },
        )(buf)
    }

    fn parse_helo(buf: &'a [u8]) -> IResult<&'a [u8], Command<&'a str>> {
        map(
            preceded(
                tuple((tag_no_case(b"HELO"), tag(b" "), space0)),
                Hostname::parse_until(b"\r"),
            ),
            |hostname| Command::Helo { hostname },
        )(buf)
    }

    fn parse_mail(buf: &'a [u8]) -> IResult<&'a [u8], Command<&'a str>> {
        let (buf, _) = tuple((tag_no_case(b"MAIL FROM:"), tag(b"<")))(buf)?;
        if let Ok((buf, _)) = tag::<_, _, nom::error::Error<&[u8]>>(b">")(buf) {
            let (buf, params) = parameters(buf)?;
            return Ok((
                buf,
                Command::Mail {
                    path: None,
                    email: None,
                    params,
                },
            ));
        }
        let (buf, path) = opt(terminated(Path::parse_until(b"@:"), tag(b":")))(buf)?;
        let (buf, email) = Email::parse_until(b">", b"@>")(buf)?;
        let (buf, _) = tag(b">")(buf)?;
        let (buf, params) = parameters(buf)?;
        Ok((
            buf,
            Command::Mail {
                path,
                email: Some(email),
                params,
            },
        ))
    }

    fn parse_rcpt(buf: &'a [u8]) -> IResult<&'a [u8], Command<&'a str>> {
        let (buf, _) = tag_no_case(b"RCPT TO:<")(buf)?;
        let (buf, path) = opt(terminated(Path::parse_until(b"@:"), tag(b":")))(buf)?;
        let (buf, email) = Email::parse_until(b">", b"@>")(buf)?;
        let (buf, _) = tag(b">")(buf)?;
        let (buf, params) = parameters(buf)?;
        Ok((
            buf,
            Command::Rcpt {
                path,
                email,
                params,
            },
        ))
    }

    fn parse_data(buf: &'a [u8]) -> IResult<&'a [u8], Command<&'a str>> {
        value(Command::Data, tag_no_case(b"DATA"))(buf)
    }

    fn parse_rset(buf: &'a [u8]) -> IResult<&'a [u8], Command<&'a str>> {
        value(Command::Rset, tag_no_case(b"RSET"))(buf)
    }

    fn parse_starttls(buf: &'a [u8]) -> IResult<&'a [u8], Command<&'a str>> {
        value(Command::Starttls, tag_no_case(b"STARTTLS"))(buf)
    }

    fn parse_xclient(buf: &'a [u8]) -> IResult<&'a [u8], Command<&'a str>> {
        map(
            preceded(tag_no_case(b"XCLIENT"), parameters),
            |params| Command::Xclient { params },
        )(buf)
    }

    fn parse_expn(buf: &'a [u8]) -> IResult<&'a [u8], Command<&'a str>> {
        map(
            preceded(tuple((tag_no_case(b"EXPN"), tag(b" "))), rest_as_utf8),
            |name| Command::Expn { name },
        )(buf)
    }

    fn parse_vrfy(buf: &'a [u8]) -> IResult<&'a [u8], Command<&'a str>> {
        map(
            preceded(tuple((tag_no_case(b"VRFY"), tag(b" "))), rest_as_utf8),
            |name| Command::Vrfy { name },
        )(buf)
    }

    fn parse_help(buf: &'a [u8]) -> IResult<&'a [u8], Command<&'a str>> {
        map(
            preceded(tag_no_case(b"HELP"), opt(preceded(tag(b" "), rest_as_utf8))),
            |subject| Command::Help {
                subject: subject.unwrap_or_else(|| MaybeUtf8::from("")),
            },
        )(buf)
    }

    fn parse_noop(buf: &'a [u8]) -> IResult<&'a [u8], Command<&'a str>> {
        map(
            preceded(tag_no_case(b"NOOP"), opt(preceded(tag(b" "), rest_as_utf8))),
            |string| Command::Noop {
                string: string.unwrap_or_else(|| MaybeUtf8::from("")),
            },
        )(buf)
    }

    fn parse_quit(buf: &'a [u8]) -> IResult<&'a [u8], Command<&'a str>> {
        value(Command::Quit, tag_no_case(b"QUIT"))(buf)
    }
}

fn rest_as_utf8(buf: &[u8]) -> IResult<&[u8], MaybeUtf8<&str>> {
    map_opt(take_while1(|b: u8| b != b'\r' && b != b'\n'), |b: &[u8]| {
        std::str::from_utf8(b).ok().map(MaybeUtf8::from)
    })(buf)
}

impl<S> Command<S>
where
    S: AsRef<str>,
{
    pub fn as_io_slices(&self) -> Vec<IoSlice> {
        // Built eagerly: commands are short and sent rarely enough (once per
        // recipient at most) that an allocating builder beats a lazily
        // streamed iterator here.
        let mut v = Vec::new();
        match self {
            Command::Ehlo { hostname } => {
                v.push(IoSlice::new(b"EHLO "));
                v.extend(hostname.as_io_slices());
            }
            Command::Helo { hostname } => {
                v.push(IoSlice::new(b"HELO "));
                v.extend(hostname.as_io_slices());
            }
            Command::Mail { email, params, .. } => {
                v.push(IoSlice::new(b"MAIL FROM:<"));
                if let Some(email) = email {
                    v.extend(email.as_io_slices());
                }
                v.push(IoSlice::new(b">"));
                push_params(&mut v, params);
            }
            Command::Rcpt { email, params, .. } => {
                v.push(IoSlice::new(b"RCPT TO:<"));
                v.extend(email.as_io_slices());
                v.push(IoSlice::new(b">"));
                push_params(&mut v, params);
            }
            Command::Data => v.push(IoSlice::new(b"DATA")),
            Command::Rset => v.push(IoSlice::new(b"RSET")),
            Command::Starttls => v.push(IoSlice::new(b"STARTTLS")),
            Command::Xclient { params } => {
                v.push(IoSlice::new(b"XCLIENT"));
                push_params(&mut v, params);
            }
            Command::Expn { name } => {
                v.push(IoSlice::new(b"EXPN "));
                v.push(IoSlice::new(name.as_str().as_bytes()));
            }
            Command::Vrfy { name } => {
                v.push(IoSlice::new(b"VRFY "));
                v.push(IoSlice::new(name.as_str().as_bytes()));
            }
            Command::Help { subject } => {
                v.push(IoSlice::new(b"HELP "));
                v.push(IoSlice::new(subject.as_str().as_bytes()));
            }
            Command::Noop { string } => {
                v.push(IoSlice::new(b"NOOP "));
                v.push(IoSlice::new(string.as_str().as_bytes()));
            }
            Command::Quit => v.push(IoSlice::new(b"QUIT")),
        }
        v.push(IoSlice::new(b"\r\n"));
        v
    }
}

fn push_params<'a, S: AsRef<str>>(v: &mut Vec<IoSlice<'a>>, params: &'a Parameters<S>) {
    for (name, value) in &params.0 {
        v.push(IoSlice::new(b" "));
        v.push(IoSlice::new(name.as_str().as_bytes()));
        if let Some(value) = value {
            v.push(IoSlice::new(b"="));
            v.push(IoSlice::new(value.as_ref().as_bytes()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ehlo() {
        let (rem, cmd) = Command::parse(b"EHLO foo.bar\r\n").unwrap();
        assert_eq!(rem, b"\r\n");
        assert_eq!(
            cmd,
            Command::Ehlo {
                hostname: Hostname::AsciiDomain { raw: "foo.bar" }
            }
        );
    }

    #[test]
    fn parse_lhlo() {
        let (rem, cmd) = Command::parse(b"LHLO foo.bar\r\n").unwrap();
        assert_eq!(rem, b"\r\n");
        assert_eq!(
            cmd,
            Command::Ehlo {
                hostname: Hostname::AsciiDomain { raw: "foo.bar" }
            }
        );
    }

    #[test]
    fn parse_mail_from_empty() {
        let (_, cmd) = Command::parse(b"MAIL FROM:<>\r\n").unwrap();
        match cmd {
            Command::Mail { email: None, .. } => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parse_rcpt_with_params() {
        let (_, cmd) = Command::parse(b"RCPT TO:<foo@bar.com> NOTIFY=SUCCESS\r\n").unwrap();
        match cmd {
            Command::Rcpt { params, .. } => {
                assert_eq!(params.get("NOTIFY"), Some(&Some("SUCCESS")));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parse_data_rset_quit() {
        assert_eq!(Command::parse(b"DATA\r\n").unwrap().1, Command::Data);
        assert_eq!(Command::parse(b"RSET\r\n").unwrap().1, Command::Rset);
        assert_eq!(Command::parse(b"QUIT\r\n").unwrap().1, Command::Quit);
    }

    #[test]
    fn parse_xclient() {
        let (_, cmd) = Command::parse(b"XCLIENT ADDR=10.0.0.1 NAME=relay.example\r\n").unwrap();
        match cmd {
            Command::Xclient { params } => {
                assert_eq!(params.get("ADDR"), Some(&Some("10.0.0.1")));
                assert_eq!(params.get("NAME"), Some(&Some("relay.example")));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn round_trip_rcpt() {
        let cmd = Command::Rcpt {
            path: None,
            email: Email::<&str>::parse_until(b">", b"@>")(b"foo@bar.com>")
                .unwrap()
                .1,
            params: Parameters(vec![]),
        };
        let slices = cmd.as_io_slices();
        let mut buf = Vec::new();
        for s in &slices {
            buf.extend_from_slice(s);
        }
        assert_eq!(buf, b"RCPT TO:<foo@bar.com>\r\n");
    }
}
