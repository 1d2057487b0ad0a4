//! Typed view of a decoded or to-be-encoded field section: pseudo-header
//! fields split out from regular fields.

use std::fmt;

use http::header::{self, HeaderName, HeaderValue};
use http::uri::{Authority, PathAndQuery, Scheme};
use http::{HeaderMap, Method, StatusCode};

use crate::qpack::HeaderField;

/// A field section with its pseudo-header fields pulled apart.
#[derive(Debug)]
#[cfg_attr(test, derive(Clone))]
pub struct Header {
    pub pseudo: Pseudo,
    pub fields: HeaderMap,
}

impl Header {
    /// A response section carrying `:status` and the given fields.
    pub fn response(status: StatusCode, fields: HeaderMap) -> Self {
        Self {
            pseudo: Pseudo {
                status: Some(status),
                ..Pseudo::default()
            },
            fields,
        }
    }

    /// A trailer section. Pseudo-header fields must not appear in trailers
    /// (RFC 9114, section 4.3).
    pub fn trailer(fields: HeaderMap) -> Self {
        Self {
            pseudo: Pseudo::default(),
            fields,
        }
    }

    /// Whether this is a 1xx response section.
    pub fn is_informational(&self) -> bool {
        self.pseudo.status.is_some_and(|s| s.is_informational())
    }

    pub fn into_fields(self) -> HeaderMap {
        self.fields
    }
}

/// Pseudo-header fields carry what HTTP/1.x put on the request/status
/// line. They precede all regular fields, start with ':' and are
/// lowercase.
#[derive(Debug, Default)]
#[cfg_attr(test, derive(Clone))]
pub struct Pseudo {
    // Request
    pub method: Option<Method>,
    pub scheme: Option<Scheme>,
    pub authority: Option<Authority>,
    pub path: Option<PathAndQuery>,

    // Response
    pub status: Option<StatusCode>,
}

impl Pseudo {
    /// True if any pseudo-header field is present.
    pub fn any(&self) -> bool {
        self.method.is_some()
            || self.scheme.is_some()
            || self.authority.is_some()
            || self.path.is_some()
            || self.status.is_some()
    }
}

impl TryFrom<Vec<HeaderField>> for Header {
    type Error = HeaderError;

    fn try_from(headers: Vec<HeaderField>) -> Result<Self, Self::Error> {
        let mut fields = HeaderMap::with_capacity(headers.len());
        let mut pseudo = Pseudo::default();
        let mut seen_regular = false;

        for field in headers {
            let (name, value) = field.into_inner();
            match Field::parse(&name, &value)? {
                Field::Method(m) => set_pseudo(&mut pseudo.method, m, ":method", seen_regular)?,
                Field::Scheme(s) => set_pseudo(&mut pseudo.scheme, s, ":scheme", seen_regular)?,
                Field::Authority(a) => set_pseudo(&mut pseudo.authority, a, ":authority", seen_regular)?,
                Field::Path(p) => set_pseudo(&mut pseudo.path, p, ":path", seen_regular)?,
                Field::Status(s) => set_pseudo(&mut pseudo.status, s, ":status", seen_regular)?,
                Field::Header((n, v)) => {
                    seen_regular = true;
                    fields.append(n, v);
                }
            }
        }

        Ok(Self { pseudo, fields })
    }
}

/// All pseudo-header fields must appear before regular fields, and at most
/// once each (RFC 9114, section 4.3).
fn set_pseudo<T>(
    slot: &mut Option<T>,
    value: T,
    name: &'static str,
    seen_regular: bool,
) -> Result<(), HeaderError> {
    if seen_regular {
        return Err(HeaderError::PseudoAfterFields(name));
    }
    if slot.replace(value).is_some() {
        return Err(HeaderError::DuplicatePseudo(name));
    }
    Ok(())
}

impl IntoIterator for Header {
    type Item = HeaderField;
    type IntoIter = HeaderIter;

    fn into_iter(self) -> Self::IntoIter {
        HeaderIter {
            pseudo: Some(self.pseudo),
            last_header_name: None,
            fields: self.fields.into_iter(),
        }
    }
}

pub struct HeaderIter {
    pseudo: Option<Pseudo>,
    last_header_name: Option<HeaderName>,
    fields: header::IntoIter<HeaderValue>,
}

impl Iterator for HeaderIter {
    type Item = HeaderField;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(ref mut pseudo) = self.pseudo {
            if let Some(method) = pseudo.method.take() {
                return Some((":method", method.as_str()).into());
            }
            if let Some(scheme) = pseudo.scheme.take() {
                return Some((":scheme", scheme.as_str()).into());
            }
            if let Some(authority) = pseudo.authority.take() {
                return Some((":authority", authority.as_str()).into());
            }
            if let Some(path) = pseudo.path.take() {
                return Some((":path", path.as_str()).into());
            }
            if let Some(status) = pseudo.status.take() {
                return Some((":status", status.as_str()).into());
            }
        }
        self.pseudo = None;

        // Each value of a repeated name comes out as its own field, so
        // set-cookie is never comma-joined on the wire.
        for (new_header_name, header_value) in self.fields.by_ref() {
            if let Some(new) = new_header_name {
                self.last_header_name = Some(new);
            }
            if let (Some(n), v) = (&self.last_header_name, header_value) {
                return Some((n.as_str(), v.as_bytes()).into());
            }
        }

        None
    }
}

impl fmt::Debug for HeaderIter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeaderIter").finish_non_exhaustive()
    }
}

enum Field {
    Method(Method),
    Scheme(Scheme),
    Authority(Authority),
    Path(PathAndQuery),
    Status(StatusCode),
    Header((HeaderName, HeaderValue)),
}

impl Field {
    fn parse(name: &[u8], value: &[u8]) -> Result<Self, HeaderError> {
        if name.is_empty() {
            return Err(HeaderError::InvalidHeaderName("name is empty".into()));
        }

        if name[0] != b':' {
            return Ok(Self::Header((
                HeaderName::from_bytes(name).map_err(|_| HeaderError::invalid_name(name))?,
                HeaderValue::from_bytes(value).map_err(|_| HeaderError::invalid_value(name, value))?,
            )));
        }

        Ok(match name {
            b":scheme" => Self::Scheme(try_value(name, value)?),
            b":authority" => Self::Authority(try_value(name, value)?),
            b":path" => Self::Path(try_value(name, value)?),
            b":method" => Self::Method(
                Method::from_bytes(value).map_err(|_| HeaderError::invalid_value(name, value))?,
            ),
            b":status" => Self::Status(
                StatusCode::from_bytes(value).map_err(|_| HeaderError::invalid_value(name, value))?,
            ),
            _ => return Err(HeaderError::invalid_name(name)),
        })
    }
}

fn try_value<R>(name: &[u8], value: &[u8]) -> Result<R, HeaderError>
where
    R: std::str::FromStr,
{
    let s = std::str::from_utf8(value).map_err(|_| HeaderError::invalid_value(name, value))?;
    R::from_str(s).map_err(|_| HeaderError::invalid_value(name, value))
}

#[derive(Debug)]
pub enum HeaderError {
    InvalidHeaderName(String),
    InvalidHeaderValue(String),
    DuplicatePseudo(&'static str),
    PseudoAfterFields(&'static str),
}

impl HeaderError {
    fn invalid_name(name: &[u8]) -> Self {
        Self::InvalidHeaderName(format!("{:?}", String::from_utf8_lossy(name)))
    }

    fn invalid_value(name: &[u8], value: &[u8]) -> Self {
        Self::InvalidHeaderValue(format!(
            "{:?} {:?}",
            String::from_utf8_lossy(name),
            String::from_utf8_lossy(value)
        ))
    }
}

impl std::error::Error for HeaderError {}

impl fmt::Display for HeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidHeaderName(h) => write!(f, "invalid header name: {h}"),
            Self::InvalidHeaderValue(v) => write!(f, "invalid header value: {v}"),
            Self::DuplicatePseudo(n) => write!(f, "duplicate pseudo-header {n}"),
            Self::PseudoAfterFields(n) => write!(f, "pseudo-header {n} after regular fields"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn splits_pseudo_from_fields() {
        let header = Header::try_from(vec![
            (b":method", Method::GET.as_str().as_bytes()).into(),
            (b":scheme", &b"https"[..]).into(),
            (b":authority", &b"example.com:8443"[..]).into(),
            (b":path", &b"/index?x=1"[..]).into(),
            (b"accept", &b"*/*"[..]).into(),
        ])
        .unwrap();

        assert_eq!(header.pseudo.method, Some(Method::GET));
        assert_eq!(header.pseudo.scheme, Some(Scheme::HTTPS));
        let authority = header.pseudo.authority.as_ref().unwrap();
        assert_eq!(authority.host(), "example.com");
        assert_eq!(authority.port_u16(), Some(8443));
        assert_eq!(header.pseudo.path.as_ref().unwrap().path(), "/index");
        assert_eq!(header.fields.get("accept").unwrap(), "*/*");
    }

    #[test]
    fn invalid_authority() {
        assert_matches!(
            Header::try_from(vec![(b":authority", &b"[::invalid"[..]).into()]),
            Err(HeaderError::InvalidHeaderValue(_))
        );
    }

    #[test]
    fn unknown_pseudo() {
        assert_matches!(
            Header::try_from(vec![(b":proto", &b"x"[..]).into()]),
            Err(HeaderError::InvalidHeaderName(_))
        );
    }

    #[test]
    fn duplicate_pseudo() {
        assert_matches!(
            Header::try_from(vec![
                (b":method", &b"GET"[..]).into(),
                (b":method", &b"POST"[..]).into(),
            ]),
            Err(HeaderError::DuplicatePseudo(":method"))
        );
    }

    #[test]
    fn pseudo_after_regular_field() {
        assert_matches!(
            Header::try_from(vec![
                (b"accept", &b"*/*"[..]).into(),
                (b":method", &b"GET"[..]).into(),
            ]),
            Err(HeaderError::PseudoAfterFields(":method"))
        );
    }

    #[test]
    fn duplicate_fields_are_preserved() {
        let header = Header::try_from(vec![
            (b":method", &b"GET"[..]).into(),
            (b"set-cookie", &b"foo=foo"[..]).into(),
            (b"set-cookie", &b"bar=bar"[..]).into(),
        ])
        .unwrap();
        let cookies: Vec<_> = header.fields.get_all("set-cookie").iter().collect();
        assert_eq!(cookies.len(), 2);
    }

    #[test]
    fn response_iterates_status_first_and_cookies_apart() {
        let mut fields = HeaderMap::new();
        fields.append("set-cookie", HeaderValue::from_static("a=1"));
        fields.append("set-cookie", HeaderValue::from_static("b=2"));
        fields.insert("server", HeaderValue::from_static("drover"));

        let emitted: Vec<HeaderField> =
            Header::response(StatusCode::OK, fields).into_iter().collect();

        assert_eq!(emitted[0], (":status", "200").into());
        let cookies: Vec<_> = emitted
            .iter()
            .filter(|f| f.name.as_ref() == b"set-cookie")
            .collect();
        assert_eq!(cookies.len(), 2);
    }

    #[test]
    fn trailer_has_no_pseudo() {
        let mut fields = HeaderMap::new();
        fields.insert("grpc-status", HeaderValue::from_static("0"));
        let emitted: Vec<HeaderField> = Header::trailer(fields).into_iter().collect();
        assert_eq!(emitted, vec![("grpc-status", "0").into()]);
    }
}
