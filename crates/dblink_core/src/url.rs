use crate::error::DbError;

/// Prefix every connection URL carries. Kept identical to the original
/// C++ library so URLs remain interchangeable between both bindings.
pub const URL_PREFIX: &str = "cpp_dbc:";

/// `cpp_dbc:<scheme>:<tail>` split into scheme and tail.
pub fn split_scheme(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix(URL_PREFIX)?;
    let colon = rest.find(':')?;
    Some((&rest[..colon], &rest[colon + 1..]))
}

/// True when `url` is `cpp_dbc:<scheme>:...`.
pub fn has_scheme(url: &str, scheme: &str) -> bool {
    url.strip_prefix(URL_PREFIX)
        .and_then(|rest| rest.strip_prefix(scheme))
        .is_some_and(|rest| rest.starts_with(':'))
}

/// Parsed tail of a networked engine URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPortDatabase {
    pub host: String,
    pub port: u16,
    pub database: String,
}

/// Parse `cpp_dbc:<scheme>://HOST[:PORT]/DATABASE`.
pub fn parse_host_port_database(
    url: &str,
    scheme: &str,
    default_port: u16,
) -> Result<HostPortDatabase, DbError> {
    let tail = match split_scheme(url) {
        Some((s, tail)) if s == scheme => tail,
        _ => {
            return Err(DbError::malformed_url(
                "3A7F1E42C96D",
                format!("expected {}{}: prefix in '{}'", URL_PREFIX, scheme, url),
            ));
        }
    };

    let rest = tail.strip_prefix("//").ok_or_else(|| {
        DbError::malformed_url(
            "4B802F53DA7E",
            format!("expected '//' after scheme in '{}'", url),
        )
    })?;

    let slash = rest.find('/').ok_or_else(|| {
        DbError::malformed_url(
            "5C913A64EB8F",
            format!("missing database name in '{}'", url),
        )
    })?;

    let (authority, database) = (&rest[..slash], &rest[slash + 1..]);
    if database.is_empty() {
        return Err(DbError::malformed_url(
            "6DA24B75FC90",
            format!("missing database name in '{}'", url),
        ));
    }

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port_text)) => {
            let port = port_text.parse::<u16>().map_err(|_| {
                DbError::malformed_url(
                    "7EB35C860DA1",
                    format!("invalid port '{}' in '{}'", port_text, url),
                )
            })?;
            (host, port)
        }
        None => (authority, default_port),
    };

    if host.is_empty() {
        return Err(DbError::malformed_url(
            "8FC46D971EB2",
            format!("missing host in '{}'", url),
        ));
    }

    Ok(HostPortDatabase {
        host: host.to_string(),
        port,
        database: database.to_string(),
    })
}

/// Parse `cpp_dbc:sqlite:PATH` (including `:memory:`).
pub fn parse_sqlite_path(url: &str) -> Result<String, DbError> {
    match split_scheme(url) {
        Some(("sqlite", tail)) if !tail.is_empty() => Ok(tail.to_string()),
        Some(("sqlite", _)) => Err(DbError::malformed_url(
            "90D57EA82FC3",
            format!("missing database path in '{}'", url),
        )),
        _ => Err(DbError::malformed_url(
            "A1E68FB930D4",
            format!("expected {}sqlite: prefix in '{}'", URL_PREFIX, url),
        )),
    }
}

/// Strip the library prefix from a MongoDB URL, yielding a native
/// `mongodb://` or `mongodb+srv://` URI.
pub fn parse_mongodb_uri(url: &str) -> Result<String, DbError> {
    match split_scheme(url) {
        Some((scheme @ ("mongodb" | "mongodb+srv"), tail)) => {
            Ok(format!("{}:{}", scheme, tail))
        }
        _ => Err(DbError::malformed_url(
            "B2F790CA41E5",
            format!("expected {}mongodb: prefix in '{}'", URL_PREFIX, url),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_splitting() {
        assert_eq!(
            split_scheme("cpp_dbc:mysql://h/db"),
            Some(("mysql", "//h/db"))
        );
        assert_eq!(split_scheme("cpp_dbc:sqlite::memory:"), Some(("sqlite", ":memory:")));
        assert_eq!(split_scheme("jdbc:mysql://h/db"), None);
        assert!(has_scheme("cpp_dbc:postgresql://h/db", "postgresql"));
        assert!(!has_scheme("cpp_dbc:postgresql2://h/db", "postgresql"));
    }

    #[test]
    fn host_port_database_with_explicit_port() {
        let parsed =
            parse_host_port_database("cpp_dbc:mysql://db.example.com:3307/app", "mysql", 3306)
                .unwrap();
        assert_eq!(parsed.host, "db.example.com");
        assert_eq!(parsed.port, 3307);
        assert_eq!(parsed.database, "app");
    }

    #[test]
    fn host_port_database_defaults_port() {
        let parsed =
            parse_host_port_database("cpp_dbc:postgresql://localhost/app", "postgresql", 5432)
                .unwrap();
        assert_eq!(parsed.port, 5432);
    }

    #[test]
    fn host_port_database_rejects_bad_tails() {
        for url in [
            "cpp_dbc:mysql:no-slashes",
            "cpp_dbc:mysql://host-only",
            "cpp_dbc:mysql://host/",
            "cpp_dbc:mysql://:3306/db",
            "cpp_dbc:mysql://host:notaport/db",
            "cpp_dbc:oracle://host/db",
        ] {
            assert!(
                parse_host_port_database(url, "mysql", 3306).is_err(),
                "{} should not parse",
                url
            );
        }
    }

    #[test]
    fn sqlite_paths() {
        assert_eq!(
            parse_sqlite_path("cpp_dbc:sqlite:/var/db/app.db").unwrap(),
            "/var/db/app.db"
        );
        assert_eq!(
            parse_sqlite_path("cpp_dbc:sqlite::memory:").unwrap(),
            ":memory:"
        );
        assert!(parse_sqlite_path("cpp_dbc:sqlite:").is_err());
        assert!(parse_sqlite_path("cpp_dbc:mysql://h/db").is_err());
    }

    #[test]
    fn mongodb_uri_keeps_native_form() {
        assert_eq!(
            parse_mongodb_uri("cpp_dbc:mongodb://user:pw@h1:27017,h2:27018/app?replicaSet=rs0")
                .unwrap(),
            "mongodb://user:pw@h1:27017,h2:27018/app?replicaSet=rs0"
        );
        assert_eq!(
            parse_mongodb_uri("cpp_dbc:mongodb+srv://cluster.example.net/app").unwrap(),
            "mongodb+srv://cluster.example.net/app"
        );
        assert!(parse_mongodb_uri("cpp_dbc:mysql://h/db").is_err());
    }
}
