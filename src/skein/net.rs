use std::net::SocketAddr;

use anyhow::Context;

/// Parses a listen address from the config, accepting the `":PORT"`
/// shorthand for "bind on all interfaces".
pub fn parse_listen_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    let addr = addr.trim();
    let full;
    let candidate = if addr.starts_with(':') {
        full = format!("0.0.0.0{addr}");
        full.as_str()
    } else {
        addr
    };
    candidate
        .parse()
        .with_context(|| format!("invalid listen address {addr:?}"))
}

#[cfg(test)]
mod tests {
    use super::parse_listen_addr;

    #[test]
    fn port_only_shorthand_binds_all_interfaces() {
        assert_eq!(
            parse_listen_addr(":8080").unwrap(),
            "0.0.0.0:8080".parse().unwrap()
        );
        assert_eq!(
            parse_listen_addr(" :7000 ").unwrap(),
            "0.0.0.0:7000".parse().unwrap()
        );
    }

    #[test]
    fn full_addresses_pass_through() {
        assert_eq!(
            parse_listen_addr("127.0.0.1:8080").unwrap(),
            "127.0.0.1:8080".parse().unwrap()
        );
        assert_eq!(
            parse_listen_addr("[::]:8080").unwrap(),
            "[::]:8080".parse().unwrap()
        );
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_listen_addr("not an addr").is_err());
        assert!(parse_listen_addr("").is_err());
    }
}
