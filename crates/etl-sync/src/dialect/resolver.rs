//! Map a live connection's product name and URL to a dialect.

use std::sync::Arc;

use tracing::debug;

use crate::core::catalog::DialectRegistry;
use crate::core::traits::{ConnectionInfo, Dialect};
use crate::error::Result;

use super::DialectKind;

const MYSQL_KEYWORDS: &[&str] = &["mysql", "mariadb", "tidb", "polardb", "starrocks"];
const POSTGRES_KEYWORDS: &[&str] = &["postgresql", "postgres", "opengauss", "kingbase", "gaussdb"];
const ORACLE_KEYWORDS: &[&str] = &["oracle"];
const SQLSERVER_KEYWORDS: &[&str] = &["sql server", "sqlserver"];

/// Resolves dialects against an injected registry.
#[derive(Clone)]
pub struct DialectResolver {
    registry: Arc<DialectRegistry>,
}

impl DialectResolver {
    pub fn new(registry: Arc<DialectRegistry>) -> Self {
        Self { registry }
    }

    /// Engine family for a connection.
    ///
    /// The product name is checked before the URL so that a database or host
    /// name containing another vendor's keyword cannot win over what the
    /// server reports about itself. Falls back to `Generic`.
    pub fn detect_kind(info: &ConnectionInfo) -> DialectKind {
        let product = info.product_name.to_lowercase();
        let url = info.url.to_lowercase();
        match_keywords(&product)
            .or_else(|| match_keywords(&url))
            .unwrap_or(DialectKind::Generic)
    }

    /// Dialect for a connection, looked up in the registry.
    pub fn resolve(&self, info: &ConnectionInfo) -> Result<Arc<dyn Dialect>> {
        let kind = Self::detect_kind(info);
        debug!(
            "Resolved dialect {} for product {:?} ({})",
            kind, info.product_name, info.url
        );
        self.registry.require(kind)
    }
}

fn match_keywords(text: &str) -> Option<DialectKind> {
    let families: [(&[&str], DialectKind); 4] = [
        (MYSQL_KEYWORDS, DialectKind::Mysql),
        (POSTGRES_KEYWORDS, DialectKind::Postgres),
        (ORACLE_KEYWORDS, DialectKind::Oracle),
        (SQLSERVER_KEYWORDS, DialectKind::SqlServer),
    ];
    families
        .iter()
        .find(|(keywords, _)| keywords.iter().any(|k| text.contains(k)))
        .map(|(_, kind)| *kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;

    fn info(product: &str, url: &str) -> ConnectionInfo {
        ConnectionInfo {
            product_name: product.to_string(),
            url: url.to_string(),
        }
    }

    #[test]
    fn test_detect_by_product_name() {
        assert_eq!(DialectResolver::detect_kind(&info("MySQL 8.0.36", "")), DialectKind::Mysql);
        assert_eq!(
            DialectResolver::detect_kind(&info("10.11.6-MariaDB", "")),
            DialectKind::Mysql
        );
        assert_eq!(DialectResolver::detect_kind(&info("TiDB", "")), DialectKind::Mysql);
        assert_eq!(
            DialectResolver::detect_kind(&info("PostgreSQL 16.2", "")),
            DialectKind::Postgres
        );
        assert_eq!(DialectResolver::detect_kind(&info("openGauss", "")), DialectKind::Postgres);
        assert_eq!(DialectResolver::detect_kind(&info("KingbaseES", "")), DialectKind::Postgres);
        assert_eq!(
            DialectResolver::detect_kind(&info("Oracle Database 19c", "")),
            DialectKind::Oracle
        );
        assert_eq!(
            DialectResolver::detect_kind(&info("Microsoft SQL Server", "")),
            DialectKind::SqlServer
        );
    }

    #[test]
    fn test_detect_by_url_when_product_is_unknown() {
        assert_eq!(
            DialectResolver::detect_kind(&info("", "jdbc:sqlserver://db:1433")),
            DialectKind::SqlServer
        );
        assert_eq!(
            DialectResolver::detect_kind(&info("custom", "postgresql://db:5432/app")),
            DialectKind::Postgres
        );
    }

    #[test]
    fn test_product_wins_over_url() {
        assert_eq!(
            DialectResolver::detect_kind(&info("PostgreSQL 15", "postgresql://mysql-archive:5432/x")),
            DialectKind::Postgres
        );
    }

    #[test]
    fn test_unknown_falls_back_to_generic() {
        assert_eq!(
            DialectResolver::detect_kind(&info("H2", "jdbc:h2:mem:test")),
            DialectKind::Generic
        );
    }

    #[test]
    fn test_detection_is_deterministic() {
        let i = info("MariaDB", "mysql://x");
        let first = DialectResolver::detect_kind(&i);
        for _ in 0..10 {
            assert_eq!(DialectResolver::detect_kind(&i), first);
        }
    }

    #[test]
    fn test_resolve_uses_registry() {
        let resolver = DialectResolver::new(Arc::new(DialectRegistry::with_builtins()));
        let d = resolver.resolve(&info("PostgreSQL", "")).unwrap();
        assert_eq!(d.kind(), DialectKind::Postgres);

        let empty = DialectResolver::new(Arc::new(DialectRegistry::new()));
        let err = empty.resolve(&info("Oracle", "")).err().unwrap();
        assert!(matches!(err, SyncError::UnsupportedDialect(_)));
    }
}
