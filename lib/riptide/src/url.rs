use keel::{ErrorKind, NetError, NetResult};

/// Wire protocol selected by the URL scheme.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Scheme {
    Http,
    Https,
    Ws,
    Wss,
    Mqtt,
    Mqtts,
    Tcp,
    Udp,
}

impl Scheme {
    #[inline]
    pub fn is_tls(self) -> bool {
        match self {
            Scheme::Https | Scheme::Wss | Scheme::Mqtts => true,
            _ => false,
        }
    }

    #[inline]
    pub fn is_udp(self) -> bool {
        self == Scheme::Udp
    }

    /// Default port for schemes that carry one.
    fn default_port(self) -> Option<u16> {
        match self {
            Scheme::Http | Scheme::Ws => Some(80),
            Scheme::Https | Scheme::Wss => Some(443),
            Scheme::Mqtt => Some(1883),
            Scheme::Mqtts => Some(8883),
            Scheme::Tcp | Scheme::Udp => None,
        }
    }
}

/// Decomposed endpoint URL: `scheme://host:port/uri`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Url {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub uri: String,
}

impl Url {
    /// Splits an endpoint URL into scheme, host, port and request uri.
    /// IPv6 hosts are bracketed (`tcp://[::1]:9000`). Missing ports fall
    /// back to the scheme default; `tcp://`/`udp://` require an explicit
    /// port.
    pub fn parse(input: &str) -> NetResult<Url> {
        let sep = input
            .find("://")
            .ok_or(NetError::Fatal(ErrorKind::Parse("url scheme missing")))?;

        let scheme = match &input[..sep] {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            "ws" => Scheme::Ws,
            "wss" => Scheme::Wss,
            "mqtt" => Scheme::Mqtt,
            "mqtts" => Scheme::Mqtts,
            "tcp" => Scheme::Tcp,
            "udp" => Scheme::Udp,
            _ => return Err(NetError::Fatal(ErrorKind::Parse("unknown url scheme"))),
        };

        let rest = &input[sep + 3..];
        let (authority, uri) = match rest.find('/') {
            Some(slash) => (&rest[..slash], &rest[slash..]),
            None => (rest, "/"),
        };

        if authority.is_empty() {
            return Err(NetError::Fatal(ErrorKind::Parse("url host missing")));
        }

        let (host, port_str) = if authority.starts_with('[') {
            let close = authority
                .find(']')
                .ok_or(NetError::Fatal(ErrorKind::Parse("unterminated ipv6 host")))?;
            let tail = &authority[close + 1..];

            match tail.strip_prefix(':') {
                Some(port) => (&authority[1..close], Some(port)),
                None if tail.is_empty() => (&authority[1..close], None),
                None => return Err(NetError::Fatal(ErrorKind::Parse("malformed authority"))),
            }
        } else {
            match authority.rfind(':') {
                Some(colon) => (&authority[..colon], Some(&authority[colon + 1..])),
                None => (authority, None),
            }
        };

        if host.is_empty() {
            return Err(NetError::Fatal(ErrorKind::Parse("url host missing")));
        }

        let port = match port_str {
            Some(text) => text
                .parse::<u16>()
                .map_err(|_| NetError::Fatal(ErrorKind::Parse("malformed port")))?,
            None => scheme
                .default_port()
                .ok_or(NetError::Fatal(ErrorKind::Parse("port required for scheme")))?,
        };

        Ok(Url {
            scheme,
            host: host.to_owned(),
            port,
            uri: uri.to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_http_default_port() {
        let url = Url::parse("http://example.com/index.html").unwrap();
        assert_eq!(url.scheme, Scheme::Http);
        assert_eq!(url.host, "example.com");
        assert_eq!(url.port, 80);
        assert_eq!(url.uri, "/index.html");
    }

    #[test]
    fn test_parse_explicit_port_and_bare_uri() {
        let url = Url::parse("mqtt://broker.local:1884").unwrap();
        assert_eq!(url.scheme, Scheme::Mqtt);
        assert_eq!(url.host, "broker.local");
        assert_eq!(url.port, 1884);
        assert_eq!(url.uri, "/");
    }

    #[test]
    fn test_parse_tls_schemes() {
        assert!(Url::parse("https://x.io").unwrap().scheme.is_tls());
        assert!(Url::parse("wss://x.io").unwrap().scheme.is_tls());
        assert!(Url::parse("mqtts://x.io").unwrap().scheme.is_tls());
        assert!(!Url::parse("ws://x.io").unwrap().scheme.is_tls());
        assert_eq!(Url::parse("mqtts://x.io").unwrap().port, 8883);
    }

    #[test]
    fn test_parse_ipv6_host() {
        let url = Url::parse("tcp://[::1]:9000").unwrap();
        assert_eq!(url.host, "::1");
        assert_eq!(url.port, 9000);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(Url::parse("example.com").is_err());
        assert!(Url::parse("gopher://example.com").is_err());
        assert!(Url::parse("tcp://example.com").is_err());
        assert!(Url::parse("http://:80").is_err());
        assert!(Url::parse("tcp://host:notaport").is_err());
    }
}
