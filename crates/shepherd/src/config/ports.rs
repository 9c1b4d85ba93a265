//! Best-effort port resolution.
//!
//! A service's listening port is never declared directly; it is
//! extracted from the command arguments, the health check URL, or a
//! table of well-known defaults, in that order.

/// Well-known default port for common services.
pub fn known_port(service: &str) -> Option<u16> {
    match service.to_ascii_lowercase().as_str() {
        "consul" => Some(8500),
        "ollama" | "ollama_server" => Some(11434),
        "redis" | "redis-server" => Some(6379),
        "postgres" | "postgresql" => Some(5432),
        "mysql" | "mysqld" => Some(3306),
        "nats" | "nats-server" => Some(4222),
        _ => None,
    }
}

/// Extract a port from command-line arguments.
///
/// Recognizes `--port N`, `-p N`, `--port=N` and, as a last resort, the
/// first bare numeric argument in the valid port range.
pub fn port_from_args(args: &[String]) -> Option<u16> {
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        if arg == "--port" || arg == "-p" {
            if let Some(value) = iter.peek() {
                if let Ok(port) = value.parse::<u16>() {
                    if port > 0 {
                        return Some(port);
                    }
                }
            }
        } else if let Some(value) = arg.strip_prefix("--port=") {
            if let Ok(port) = value.parse::<u16>() {
                if port > 0 {
                    return Some(port);
                }
            }
        }
    }

    args.iter()
        .filter(|a| a.chars().all(|c| c.is_ascii_digit()))
        .find_map(|a| a.parse::<u16>().ok().filter(|p| *p > 0))
}

/// Extract a port from a health check URL such as
/// `http://127.0.0.1:8500/v1/status/leader` or `tcp://host:8010`.
pub fn port_from_url(url: &str) -> Option<u16> {
    if let Some(rest) = url.strip_prefix("tcp:") {
        if let Ok(port) = rest.parse::<u16>() {
            return Some(port);
        }
    }

    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    let authority = rest.split('/').next()?;
    let (_, port) = authority.rsplit_once(':')?;
    port.parse::<u16>().ok().filter(|p| *p > 0)
}
