use std::{
    io::IoSlice,
    iter,
    net::{Ipv4Addr, Ipv6Addr},
    str,
};

use auto_enums::auto_enum;
use nom::{
    branch::alt,
    bytes::streaming::{tag, take_while1},
    character::streaming::{one_of, satisfy},
    combinator::{map, map_opt, opt, peek, recognize, verify},
    multi::{many1, separated_list1},
    sequence::{pair, preceded, terminated},
    IResult,
};

use crate::*;

pub fn terminate<'a, 'b>(term: &'b [u8]) -> impl 'b + Fn(&'a [u8]) -> IResult<&'a [u8], char>
where
    'a: 'b,
{
    peek(one_of(term))
}

#[inline]
fn is_cntrl_byte(b: u8) -> bool {
    b < 0x20 || b == 0x7f
}

#[inline]
fn is_ldh(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-'
}

#[inline]
fn is_ldh_or_nonascii(b: u8) -> bool {
    is_ldh(b) || b == b'.' || b >= 0x80
}

#[inline]
fn is_atext(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'!' | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'/'
                | b'='
                | b'?'
                | b'^'
                | b'_'
                | b'`'
                | b'{'
                | b'|'
                | b'~'
        )
}

#[inline]
fn is_atext_or_nonascii(b: u8) -> bool {
    is_atext(b) || b >= 0x80
}

/// Consumes an LDH label (`[[:alnum:]]([-[:alnum:]]*[[:alnum:]])?`): ASCII-only
/// domain labels may not start nor end with a hyphen.
fn ldh_label(input: &[u8]) -> IResult<&[u8], &[u8]> {
    let (rest, matched) = verify(take_while1(is_ldh), |m: &[u8]| {
        m[0].is_ascii_alphanumeric() && m[m.len() - 1].is_ascii_alphanumeric()
    })(input)?;
    Ok((rest, matched))
}

fn ascii_domain(input: &[u8]) -> IResult<&[u8], &[u8]> {
    recognize(separated_list1(tag(b"."), ldh_label))(input)
}

fn ipv4_literal(input: &[u8]) -> IResult<&[u8], &[u8]> {
    recognize(preceded(
        tag(b"["),
        terminated(take_while1(|b: u8| b.is_ascii_digit() || b == b'.'), tag(b"]")),
    ))(input)
}

fn ipv6_literal(input: &[u8]) -> IResult<&[u8], &[u8]> {
    recognize(preceded(
        tag(b"[IPv6:"),
        terminated(
            take_while1(|b: u8| b.is_ascii_hexdigit() || b == b':' || b == b'.'),
            tag(b"]"),
        ),
    ))(input)
}

fn utf8_domain(input: &[u8]) -> IResult<&[u8], &[u8]> {
    verify(take_while1(is_ldh_or_nonascii), |m: &[u8]| {
        !m.iter().all(|b| b.is_ascii())
    })(input)
}

// TODO: find out an AsciiString type, and use it here (and below)
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum MaybeUtf8<S = String> {
    Ascii(S),
    Utf8(S),
}

impl MaybeUtf8<&str> {
    pub fn to_owned(&self) -> MaybeUtf8<String> {
        match self {
            MaybeUtf8::Ascii(s) => MaybeUtf8::Ascii(s.to_string()),
            MaybeUtf8::Utf8(s) => MaybeUtf8::Utf8(s.to_string()),
        }
    }
}

// TODO: make this a trait once returning existentials from trait methods is a
// thing
impl<S> MaybeUtf8<S>
where
    S: AsRef<str>,
{
    #[inline]
    pub fn as_str(&self) -> &str {
        match self {
            MaybeUtf8::Ascii(s) => s.as_ref(),
            MaybeUtf8::Utf8(s) => s.as_ref(),
        }
    }

    #[inline]
    pub fn as_io_slices(&self) -> impl Iterator<Item = IoSlice> {
        iter::once(match self {
            MaybeUtf8::Ascii(s) => IoSlice::new(s.as_ref().as_ref()),
            MaybeUtf8::Utf8(s) => IoSlice::new(s.as_ref().as_ref()),
        })
    }
}

impl<'a, S> From<&'a str> for MaybeUtf8<S>
where
    S: From<&'a str>,
{
    #[inline]
    fn from(s: &'a str) -> MaybeUtf8<S> {
        if s.is_ascii() {
            MaybeUtf8::Ascii(s.into())
        } else {
            MaybeUtf8::Utf8(s.into())
        }
    }
}

/// Note: comparison happens only on the `raw` field, meaning that if you
/// modify or create a `Hostname` yourself it could have surprising results.
/// But such a `Hostname` would then not actually represent a real hostname,
/// so you probably would have had surprising results anyway.
#[derive(Clone, Debug, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum Hostname<S = String> {
    Utf8Domain { raw: S, punycode: String },
    AsciiDomain { raw: S },
    Ipv6 { raw: S, ip: Ipv6Addr },
    Ipv4 { raw: S, ip: Ipv4Addr },
}

impl<S> Hostname<S> {
    pub fn parse_until<'a, 'b>(
        term: &'b [u8],
    ) -> impl 'b + Fn(&'a [u8]) -> IResult<&'a [u8], Hostname<S>>
    where
        'a: 'b,
        S: 'b + From<&'a str>,
    {
        alt((
            map_opt(terminated(ipv6_literal, terminate(term)), |b: &[u8]| {
                let s = unsafe { str::from_utf8_unchecked(b) };
                let ip = unsafe { str::from_utf8_unchecked(&b[6..b.len() - 1]) };
                let ip = ip.parse::<Ipv6Addr>().ok()?;
                Some(Hostname::Ipv6 { raw: s.into(), ip })
            }),
            map_opt(terminated(ipv4_literal, terminate(term)), |b: &[u8]| {
                let s = unsafe { str::from_utf8_unchecked(b) };
                let ip = unsafe { str::from_utf8_unchecked(&b[1..b.len() - 1]) };
                let ip = ip.parse::<Ipv4Addr>().ok()?;
                Some(Hostname::Ipv4 { raw: s.into(), ip })
            }),
            map_opt(terminated(ascii_domain, terminate(term)), |b: &[u8]| {
                // Safe: `ldh_label` only ever matches ASCII bytes.
                let s = unsafe { str::from_utf8_unchecked(b) };
                Some(Hostname::AsciiDomain { raw: s.into() })
            }),
            map_opt(terminated(utf8_domain, terminate(term)), |res: &[u8]| {
                let raw = str::from_utf8(res).ok()?;
                // TODO: looks like idna exposes only an allocating method for
                // validating an IDNA domain name. Maybe it'd be possible to get
                // them to expose a validation-only function? Or maybe not.
                let punycode = idna::Config::default()
                    .use_std3_ascii_rules(true)
                    .verify_dns_length(true)
                    .check_hyphens(true)
                    .to_ascii(raw)
                    .ok()?;
                Some(Hostname::Utf8Domain {
                    raw: raw.into(),
                    punycode,
                })
            }),
        ))
    }
}

impl<S> Hostname<S> {
    #[inline]
    pub fn raw(&self) -> &S {
        match self {
            Hostname::Utf8Domain { raw, .. } => raw,
            Hostname::AsciiDomain { raw, .. } => raw,
            Hostname::Ipv4 { raw, .. } => raw,
            Hostname::Ipv6 { raw, .. } => raw,
        }
    }
}

impl<S> Hostname<S>
where
    S: AsRef<str>,
{
    #[inline]
    pub fn as_io_slices(&self) -> impl Iterator<Item = IoSlice> {
        iter::once(IoSlice::new(self.raw().as_ref().as_ref()))
    }
}

impl<S: PartialEq> std::cmp::PartialEq for Hostname<S> {
    fn eq(&self, o: &Hostname<S>) -> bool {
        self.raw() == o.raw()
    }
}

#[cfg(test)]
impl<S: Eq + PartialEq> Hostname<S> {
    fn deep_equal(&self, o: &Hostname<S>) -> bool {
        match self {
            Hostname::Utf8Domain { raw, punycode } => match o {
                Hostname::Utf8Domain {
                    raw: raw2,
                    punycode: punycode2,
                } => raw == raw2 && punycode == punycode2,
                _ => false,
            },
            Hostname::AsciiDomain { raw } => match o {
                Hostname::AsciiDomain { raw: raw2 } => raw == raw2,
                _ => false,
            },
            Hostname::Ipv4 { raw, ip } => match o {
                Hostname::Ipv4 { raw: raw2, ip: ip2 } => raw == raw2 && ip == ip2,
                _ => false,
            },
            Hostname::Ipv6 { raw, ip } => match o {
                Hostname::Ipv6 { raw: raw2, ip: ip2 } => raw == raw2 && ip == ip2,
                _ => false,
            },
        }
    }
}

impl Hostname<&str> {
    pub fn to_owned(self) -> Hostname<String> {
        match self {
            Hostname::Utf8Domain { raw, punycode } => Hostname::Utf8Domain {
                raw: (*raw).to_owned(),
                punycode,
            },
            Hostname::AsciiDomain { raw } => Hostname::AsciiDomain {
                raw: (*raw).to_owned(),
            },
            Hostname::Ipv4 { raw, ip } => Hostname::Ipv4 {
                raw: (*raw).to_owned(),
                ip,
            },
            Hostname::Ipv6 { raw, ip } => Hostname::Ipv6 {
                raw: (*raw).to_owned(),
                ip,
            },
        }
    }
}

// TODO: consider adding `Sane` variant like OpenSMTPD does, that would not be
// matched by weird characters
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum Localpart<S = String> {
    Ascii { raw: S },
    QuotedAscii { raw: S },
    Utf8 { raw: S },
    QuotedUtf8 { raw: S },
}

fn dot_string(is_char: impl Fn(u8) -> bool + Copy) -> impl Fn(&[u8]) -> IResult<&[u8], &[u8]> {
    move |input| recognize(separated_list1(tag(b"."), take_while1(is_char)))(input)
}

fn quoted_string(
    is_qtext: impl Fn(u8) -> bool + Copy,
    is_escapable: impl Fn(u8) -> bool + Copy,
) -> impl Fn(&[u8]) -> IResult<&[u8], &[u8]> {
    move |input| {
        recognize(pair(
            tag(b"\""),
            terminated(
                many1(alt((
                    recognize(preceded(tag(b"\\"), satisfy(is_escapable))),
                    recognize(satisfy(is_qtext)),
                ))),
                tag(b"\""),
            ),
        ))(input)
    }
}

fn is_qtext_ascii(c: char) -> bool {
    c.is_ascii() && !is_cntrl_byte(c as u8) && c != '"' && c != '\\'
}

fn is_escapable_ascii(c: char) -> bool {
    c.is_ascii() && !is_cntrl_byte(c as u8)
}

fn is_qtext_utf8(c: char) -> bool {
    (c as u32 >= 0x80 || (!is_cntrl_byte(c as u8) && c.is_ascii())) && c != '"' && c != '\\'
}

fn is_escapable_utf8(c: char) -> bool {
    c as u32 >= 0x80 || !is_cntrl_byte(c as u8)
}

impl<S> Localpart<S> {
    pub fn parse_until<'a, 'b>(
        term: &'b [u8],
    ) -> impl 'b + Fn(&'a [u8]) -> IResult<&'a [u8], Localpart<S>>
    where
        'a: 'b,
        S: 'b + From<&'a str>,
    {
        alt((
            map(
                terminated(quoted_string(is_qtext_ascii, is_escapable_ascii), terminate(term)),
                |b: &[u8]| {
                    let s = unsafe { str::from_utf8_unchecked(b) };
                    Localpart::QuotedAscii { raw: s.into() }
                },
            ),
            map(
                terminated(
                    verify(dot_string(is_atext), |m: &[u8]| m.iter().all(|b| b.is_ascii())),
                    terminate(term),
                ),
                |b: &[u8]| {
                    let s = unsafe { str::from_utf8_unchecked(b) };
                    Localpart::Ascii { raw: s.into() }
                },
            ),
            map(
                terminated(quoted_string(is_qtext_utf8, is_escapable_utf8), terminate(term)),
                |b: &[u8]| {
                    let s = unsafe { str::from_utf8_unchecked(b) };
                    Localpart::QuotedUtf8 { raw: s.into() }
                },
            ),
            map(
                terminated(dot_string(is_atext_or_nonascii), terminate(term)),
                |b: &[u8]| {
                    let s = unsafe { str::from_utf8_unchecked(b) };
                    Localpart::Utf8 { raw: s.into() }
                },
            ),
        ))
    }
}

impl<S> Localpart<S> {
    #[inline]
    pub fn raw(&self) -> &S {
        match self {
            Localpart::Ascii { raw } => raw,
            Localpart::QuotedAscii { raw } => raw,
            Localpart::Utf8 { raw } => raw,
            Localpart::QuotedUtf8 { raw } => raw,
        }
    }
}

impl<S> Localpart<S>
where
    S: AsRef<str>,
{
    #[inline]
    pub fn as_io_slices(&self) -> impl Iterator<Item = IoSlice> {
        iter::once(IoSlice::new(self.raw().as_ref().as_ref()))
    }
}

fn unquoted<S>(s: &S) -> String
where
    S: AsRef<str>,
{
    #[derive(Clone, Copy)]
    enum State {
        Start,
        Backslash,
    }

    s.as_ref()
        .chars()
        .skip(1)
        .scan(State::Start, |state, x| match (*state, x) {
            (State::Backslash, _) => {
                *state = State::Start;
                Some(Some(x))
            }
            (State::Start, '"') => Some(None),
            (_, '\\') => {
                *state = State::Backslash;
                Some(None)
            }
            (_, _) => {
                *state = State::Start;
                Some(Some(x))
            }
        })
        .filter_map(|x| x)
        .collect()
}

impl<S> Localpart<S>
where
    S: AsRef<str>,
{
    pub fn unquote(&self) -> MaybeUtf8<String> {
        match self {
            Localpart::Ascii { raw } => MaybeUtf8::Ascii(raw.as_ref().to_owned()),
            Localpart::Utf8 { raw } => MaybeUtf8::Utf8(raw.as_ref().to_owned()),
            Localpart::QuotedAscii { raw } => MaybeUtf8::Ascii(unquoted(raw)),
            Localpart::QuotedUtf8 { raw } => MaybeUtf8::Utf8(unquoted(raw)),
        }
    }

    /// Splits off the recipient-detail part of this localpart, given a
    /// single delimiter byte (eg. the `+` of `user+detail`), returning
    /// `(base, Some(detail))` if the delimiter was found unquoted, or
    /// `(self, None)` otherwise. Quoted localparts are never split, since
    /// the delimiter inside quotes is just ordinary text.
    pub fn split_detail(&self, delimiter: u8) -> (MaybeUtf8<String>, Option<String>) {
        let unquoted = self.unquote();
        let is_quoted = matches!(self, Localpart::QuotedAscii { .. } | Localpart::QuotedUtf8 { .. });
        if is_quoted {
            return (unquoted, None);
        }
        let s = unquoted.as_str().to_owned();
        match s.as_bytes().iter().position(|&b| b == delimiter) {
            Some(idx) => {
                let detail = s[idx + 1..].to_owned();
                let base = s[..idx].to_owned();
                let base = if base.is_ascii() {
                    MaybeUtf8::Ascii(base)
                } else {
                    MaybeUtf8::Utf8(base)
                };
                (base, Some(detail))
            }
            None => (unquoted, None),
        }
    }
}

impl Localpart<&str> {
    pub fn to_owned(&self) -> Localpart<String> {
        match self {
            Localpart::Ascii { raw } => Localpart::Ascii {
                raw: (*raw).to_owned(),
            },
            Localpart::Utf8 { raw } => Localpart::Utf8 {
                raw: (*raw).to_owned(),
            },
            Localpart::QuotedAscii { raw } => Localpart::QuotedAscii {
                raw: (*raw).to_owned(),
            },
            Localpart::QuotedUtf8 { raw } => Localpart::QuotedUtf8 {
                raw: (*raw).to_owned(),
            },
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct Email<S = String> {
    pub localpart: Localpart<S>,
    pub hostname: Option<Hostname<S>>,
}

impl<S> Email<S> {
    /// term_with_atsign must be term + b"@"
    #[inline]
    pub fn parse_until<'a, 'b>(
        term: &'b [u8],
        term_with_atsign: &'b [u8],
    ) -> impl 'b + Fn(&'a [u8]) -> IResult<&'a [u8], Email<S>>
    where
        'a: 'b,
        S: 'b + From<&'a str>,
    {
        map(
            pair(
                Localpart::parse_until(term_with_atsign),
                opt(preceded(tag(b"@"), Hostname::parse_until(term))),
            ),
            |(localpart, hostname)| Email {
                localpart,
                hostname,
            },
        )
    }

    // TODO: test parse_bracketed?
    #[inline]
    pub fn parse_bracketed<'a>(
        buf: &'a [u8],
    ) -> Result<Email<S>, nom::Err<nom::error::Error<&'a [u8]>>>
    where
        S: From<&'a str>,
    {
        match preceded(
            tag(b"<"),
            terminated(Email::parse_until(b">", b"@>"), tag(b">")),
        )(buf)
        {
            Err(e) => Err(e),
            Ok((rem, r)) if rem.is_empty() => Ok(r),
            Ok((rem, _)) => Err(nom::Err::Failure(nom::error::Error::new(
                rem,
                nom::error::ErrorKind::TooLarge,
            ))),
        }
    }
}

impl<S> Email<S>
where
    S: AsRef<str>,
{
    #[inline]
    #[auto_enum]
    pub fn as_io_slices(&self) -> impl Iterator<Item = IoSlice> {
        #[auto_enum(Iterator)]
        let hostname = match self.hostname {
            Some(ref hostname) => iter::once(IoSlice::new(b"@")).chain(hostname.as_io_slices()),
            None => iter::empty(),
        };
        self.localpart.as_io_slices().chain(hostname)
    }
}

impl Email<&str> {
    pub fn to_owned(self) -> Email<String> {
        Email {
            localpart: self.localpart.to_owned(),
            hostname: self.hostname.map(|h| h.to_owned()),
        }
    }
}

/// Note: for convenience this is not exactly like what is described by RFC5321,
/// and it does not contain the Email. Indeed, paths are *very* rare nowadays.
///
/// `Path` as defined here is what is specified in RFC5321 as `A-d-l`
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Path<S = String> {
    pub domains: Vec<Hostname<S>>,
}

impl<S> Path<S> {
    /// term_with_comma must be the wanted terminator, with b"," added
    #[inline]
    pub fn parse_until<'a, 'b>(
        term_with_comma: &'b [u8],
    ) -> impl 'b + Fn(&'a [u8]) -> IResult<&'a [u8], Path<S>>
    where
        'a: 'b,
        S: 'b + From<&'a str>,
    {
        map(
            separated_list1(
                tag(b","),
                preceded(tag(b"@"), Hostname::parse_until(term_with_comma)),
            ),
            |domains| Path { domains },
        )
    }
}

impl<S> Path<S>
where
    S: AsRef<str>,
{
    #[inline]
    pub fn as_io_slices(&self) -> impl Iterator<Item = IoSlice> {
        self.domains.iter().enumerate().flat_map(|(i, d)| {
            iter::once(match i {
                0 => IoSlice::new(b"@"),
                _ => IoSlice::new(b",@"),
            })
            .chain(d.as_io_slices())
        })
    }
}

/// Decodes an `xtext` string (RFC 3461 §4), as used in `ORCPT=` parameters
/// and the DSN-related SMTP extensions: every byte outside `!`-`~` minus `+`
/// and `=` must be represented as `+HH` (two uppercase hex digits).
pub fn xtext_decode(s: &str) -> Option<Vec<u8>> {
    let b = s.as_bytes();
    let mut out = Vec::with_capacity(b.len());
    let mut i = 0;
    while i < b.len() {
        match b[i] {
            b'+' => {
                let hex = b.get(i + 1..i + 3)?;
                let hex = str::from_utf8(hex).ok()?;
                let byte = u8::from_str_radix(hex, 16).ok()?;
                out.push(byte);
                i += 3;
            }
            c if (0x21..=0x7e).contains(&c) => {
                out.push(c);
                i += 1;
            }
            _ => return None,
        }
    }
    Some(out)
}

/// Encodes `data` as `xtext` (RFC 3461 §4).
pub fn xtext_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len());
    for &b in data {
        if (0x21..=0x7e).contains(&b) && b != b'+' && b != b'=' {
            out.push(b as char);
        } else {
            out.push_str(&format!("+{:02X}", b));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_valid() {
        let tests: &[(&[u8], &[u8], Hostname<&str>)] = &[
            (b"foo--bar>", b"", Hostname::AsciiDomain { raw: "foo--bar" }),
            (b"foo.bar.baz>", b"", Hostname::AsciiDomain {
                raw: "foo.bar.baz",
            }),
            (b"1.2.3.4>", b"", Hostname::AsciiDomain { raw: "1.2.3.4" }),
            (b"[123.255.37.2]>", b"", Hostname::Ipv4 {
                raw: "[123.255.37.2]",
                ip: "123.255.37.2".parse().unwrap(),
            }),
            (b"[IPv6:0::ffff:8.7.6.5]>", b"", Hostname::Ipv6 {
                raw: "[IPv6:0::ffff:8.7.6.5]",
                ip: "0::ffff:8.7.6.5".parse().unwrap(),
            }),
            ("élégance.fr>".as_bytes(), b"", Hostname::Utf8Domain {
                raw: "élégance.fr",
                punycode: "xn--lgance-9uab.fr".into(),
            }),
            ("papier-maché.fr>".as_bytes(), b"", Hostname::Utf8Domain {
                raw: "papier-maché.fr",
                punycode: "xn--papier-mach-lbb.fr".into(),
            }),
        ];
        for (inp, rem, out) in tests {
            let parsed = terminated(Hostname::parse_until(b">"), tag(b">"))(inp);
            match parsed {
                Ok((rest, host)) => assert!(rest == *rem && host.deep_equal(out)),
                x => panic!("Unexpected result: {:?}", x),
            }
        }
    }

    #[test]
    fn hostname_incomplete() {
        let tests: &[&[u8]] = &[b"[1.2", b"[IPv6:0::"];
        for inp in tests {
            let r = Hostname::<&str>::parse_until(b">")(inp);
            assert!(r.unwrap_err().is_incomplete());
        }
    }

    #[test]
    fn hostname_invalid() {
        let tests: &[&[u8]] = &[
            b"-foo.bar>",                 // No sub-domain starting with a dash
            b"\xFF>",                     // No invalid utf-8
            "élégance.-fr>".as_bytes(), // No dashes in utf-8 either
        ];
        for inp in tests {
            let r = Hostname::<String>::parse_until(b">")(inp);
            assert!(!r.unwrap_err().is_incomplete());
        }
    }

    #[test]
    fn localpart_valid() {
        let tests: &[(&[u8], &[u8], Localpart<&str>)] = &[
            (b"helloooo@", b"", Localpart::Ascii { raw: "helloooo" }),
            (b"test.ing>", b"", Localpart::Ascii { raw: "test.ing" }),
            (br#""hello"@"#, b"", Localpart::QuotedAscii {
                raw: r#""hello""#,
            }),
            (
                br#""hello world. This |$ a g#eat place to experiment !">"#,
                b"",
                Localpart::QuotedAscii {
                    raw: r#""hello world. This |$ a g#eat place to experiment !""#,
                },
            ),
        ];
        for (inp, rem, out) in tests {
            let r = terminated(Localpart::parse_until(b"@>"), alt((tag(b"@"), tag(b">"))))(inp);
            match r {
                Ok((rest, res)) if rest == *rem && res == *out => (),
                x => panic!("Unexpected result: {:?}", x),
            }
        }
    }

    #[test]
    fn localpart_invalid() {
        let tests: &[&[u8]] = &[br#"""@"#, br#""""@"#, b"\r@"];
        for inp in tests {
            let r = Localpart::<&str>::parse_until(b"@>")(inp);
            assert!(!r.unwrap_err().is_incomplete());
        }
    }

    #[test]
    fn localpart_unquoting() {
        let tests: &[(&[u8], MaybeUtf8<&str>)] = &[
            (
                b"t+e-s.t_i+n-g@foo.bar.baz ",
                MaybeUtf8::Ascii("t+e-s.t_i+n-g"),
            ),
            (
                br#""quoted\"example"@example.org "#,
                MaybeUtf8::Ascii(r#"quoted"example"#),
            ),
            (
                br#""escaped\\exa\mple"@example.org "#,
                MaybeUtf8::Ascii(r#"escaped\example"#),
            ),
        ];
        for (inp, out) in tests {
            let res = Email::<&str>::parse_until(b" ", b" @")(inp).unwrap().1;
            assert_eq!(res.localpart.unquote(), out.to_owned());
        }
    }

    #[test]
    fn email_valid() {
        let tests: &[(&[u8], &[u8], Email<&str>)] = &[
            (b"t+e-s.t_i+n-g@foo.bar.baz>", b"", Email {
                localpart: Localpart::Ascii {
                    raw: "t+e-s.t_i+n-g",
                },
                hostname: Some(Hostname::AsciiDomain { raw: "foo.bar.baz" }),
            }),
            (b"postmaster>", b"", Email {
                localpart: Localpart::Ascii { raw: "postmaster" },
                hostname: None,
            }),
        ];
        for (inp, rem, out) in tests {
            let r = terminated(Email::parse_until(b">", b">@"), tag(b">"))(inp);
            match r {
                Ok((rest, res)) if rest == *rem && res == *out => (),
                x => panic!("Unexpected result: {:?}", x),
            }
        }
    }

    #[test]
    fn detail_splitting() {
        let local = Localpart::Ascii { raw: "user+detail" };
        let (base, detail) = local.split_detail(b'+');
        assert_eq!(base, MaybeUtf8::Ascii("user".to_owned()));
        assert_eq!(detail, Some("detail".to_owned()));

        let local = Localpart::Ascii { raw: "user" };
        let (base, detail) = local.split_detail(b'+');
        assert_eq!(base, MaybeUtf8::Ascii("user".to_owned()));
        assert_eq!(detail, None);

        let local = Localpart::QuotedAscii { raw: r#""user+detail""# };
        let (base, detail) = local.split_detail(b'+');
        assert_eq!(base, MaybeUtf8::Ascii("user+detail".to_owned()));
        assert_eq!(detail, None);
    }

    #[test]
    fn xtext_round_trip() {
        let data = b"user+with\x01ctrl and+plus=eq";
        let encoded = xtext_encode(data);
        assert_eq!(xtext_decode(&encoded).unwrap(), data);
    }
}
