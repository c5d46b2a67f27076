use crate::error;

pub type Result<T> = ::std::result::Result<T, error::Error>;

#[macro_export]
macro_rules! io_err {
    ($kind:ident, $msg:expr) => {
        ::std::io::Error::new(::std::io::ErrorKind::$kind, $msg)
    };
}

#[macro_export]
macro_rules! res {
    ($err:expr) => {
        Err(From::from($err))
    };
}

/// A listen/connect endpoint, per spec §6: `host:port` (TCP, IPv4 or bracketed
/// IPv6) or an absolute filesystem path (Unix domain socket).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Unix(String),
}

/// Parse a `--listen` endpoint string.
///
/// An argument starting with `/` is a Unix socket path; anything else is
/// parsed as `host:port` (accepting the bracketed `[ipv6]:port` form).
pub fn parse_endpoint(arg: &str) -> Option<Endpoint> {
    if let Some(path) = arg.strip_prefix("unix:") {
        return Some(Endpoint::Unix(path.to_owned()));
    }
    if let Some(addr) = arg.strip_prefix("tcp:") {
        return Some(Endpoint::Tcp(addr.to_owned()));
    }
    if arg.starts_with('/') {
        return Some(Endpoint::Unix(arg.to_owned()));
    }
    // host:port or [ipv6]:port — validate there's a trailing port component.
    let port_start = arg.rfind(':')?;
    if port_start == 0 || port_start + 1 >= arg.len() {
        return None;
    }
    arg[port_start + 1..].parse::<u16>().ok()?;
    Some(Endpoint::Tcp(arg.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_ipv4() {
        assert_eq!(
            parse_endpoint("0.0.0.0:564"),
            Some(Endpoint::Tcp("0.0.0.0:564".into()))
        );
    }

    #[test]
    fn parses_tcp_ipv6_bracketed() {
        assert_eq!(
            parse_endpoint("[::1]:564"),
            Some(Endpoint::Tcp("[::1]:564".into()))
        );
    }

    #[test]
    fn parses_unix_absolute_path() {
        assert_eq!(
            parse_endpoint("/run/diod.sock"),
            Some(Endpoint::Unix("/run/diod.sock".into()))
        );
    }

    #[test]
    fn parses_unix_prefixed() {
        assert_eq!(
            parse_endpoint("unix:/run/diod.sock"),
            Some(Endpoint::Unix("/run/diod.sock".into()))
        );
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_endpoint("not-an-endpoint"), None);
    }
}
