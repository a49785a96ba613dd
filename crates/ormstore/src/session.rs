//! Session construction.
//!
//! # Example
//!
//! ```rust,ignore
//! use ormstore::prelude::*;
//!
//! let session = SessionBuilder::new()
//!     .batch_inserts(false)
//!     .generate_primary_keys(false)
//!     .build_with(connection);
//! ```

use ormstore_core::{AnsiDialect, Connection, Dialect};
use ormstore_object::StoreConfig;
use ormstore_session::{Session, SessionConfig};

/// Builder for [`Session`].
#[derive(Debug, Clone, Default)]
pub struct SessionBuilder<D: Dialect = AnsiDialect> {
    dialect: D,
    config: SessionConfig,
    store: StoreConfig,
}

impl SessionBuilder<AnsiDialect> {
    /// Create a builder using [`AnsiDialect`] and default settings.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<D: Dialect + 'static> SessionBuilder<D> {
    /// Compile statements with another dialect.
    pub fn dialect<E: Dialect + 'static>(self, dialect: E) -> SessionBuilder<E> {
        SessionBuilder {
            dialect,
            config: self.config,
            store: self.store,
        }
    }

    #[must_use]
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn store_config(mut self, config: StoreConfig) -> Self {
        self.store = config;
        self
    }

    #[must_use]
    pub fn flush_on_commit(mut self, value: bool) -> Self {
        self.config.flush_on_commit = value;
        self
    }

    #[must_use]
    pub fn batch_inserts(mut self, value: bool) -> Self {
        self.config.batch_inserts = value;
        self
    }

    #[must_use]
    pub fn generate_primary_keys(mut self, value: bool) -> Self {
        self.store.generate_primary_keys = value;
        self
    }

    #[must_use]
    pub fn cascade_insert(mut self, value: bool) -> Self {
        self.store.cascade_insert = value;
        self
    }

    /// Build a session around `connection`.
    pub fn build_with<C: Connection + 'static>(self, connection: C) -> Session<C, D> {
        tracing::debug!(
            flush_on_commit = self.config.flush_on_commit,
            batch_inserts = self.config.batch_inserts,
            generate_primary_keys = self.store.generate_primary_keys,
            "Building session"
        );
        Session::with_config(connection, self.dialect, self.config, self.store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ormstore_core::{Result, Row, Statement, Value};

    struct Null;

    impl Connection for Null {
        fn execute(&mut self, _sql: &str, _params: &[Value]) -> Result<u64> {
            Ok(0)
        }

        fn query(&mut self, _sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
            Ok(Vec::new())
        }

        fn begin(&mut self) -> Result<()> {
            Ok(())
        }

        fn commit(&mut self) -> Result<()> {
            Ok(())
        }

        fn rollback(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct Upper;

    impl Dialect for Upper {
        fn compile(&self, statement: &Statement) -> String {
            format!("-- {}", statement.table().to_uppercase())
        }
    }

    #[test]
    fn test_builder_applies_settings() {
        let session = SessionBuilder::new()
            .flush_on_commit(false)
            .generate_primary_keys(false)
            .build_with(Null);
        assert!(!session.config().flush_on_commit);
        assert!(session.config().batch_inserts);
        assert!(!session.store().config().generate_primary_keys);
    }

    #[test]
    fn test_builder_swaps_dialect() {
        let session = SessionBuilder::new().dialect(Upper).build_with(Null);
        let sql = session.dialect().compile(&Statement::DropTable {
            table: "hero".to_string(),
        });
        assert_eq!(sql, "-- HERO");
    }
}
