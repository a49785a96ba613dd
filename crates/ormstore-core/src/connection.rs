//! Collaborator contracts for SQL generation and statement execution.
//!
//! The object store never builds SQL text itself. The persistence layer
//! describes what it needs as a [`Statement`], asks a [`Dialect`] to compile
//! it, and hands the text plus bound parameters to a [`Connection`]. Real
//! drivers live outside this workspace; [`AnsiDialect`] is the reference
//! compiler used by tests and simple backends.

use crate::error::Result;
use crate::identifiers::quote_ident;
use crate::row::Row;
use crate::types::SqlType;
use crate::value::Value;

/// Column definition for table creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub sql_type: SqlType,
    pub nullable: bool,
    pub primary_key: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
            nullable: false,
            primary_key: false,
        }
    }

    #[must_use]
    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    #[must_use]
    pub fn primary_key(mut self, primary_key: bool) -> Self {
        self.primary_key = primary_key;
        self
    }
}

/// A dialect-independent statement description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    CreateTable {
        table: String,
        columns: Vec<ColumnDef>,
    },
    DropTable {
        table: String,
    },
    /// Insert `rows` rows with the same column list.
    Insert {
        table: String,
        columns: Vec<String>,
        rows: usize,
    },
    /// Update `columns` of the row matched by `keys`.
    Update {
        table: String,
        columns: Vec<String>,
        keys: Vec<String>,
    },
    /// Delete the rows matched by `keys`.
    Delete {
        table: String,
        keys: Vec<String>,
    },
    Select {
        table: String,
        columns: Vec<String>,
    },
}

impl Statement {
    pub fn table(&self) -> &str {
        match self {
            Statement::CreateTable { table, .. }
            | Statement::DropTable { table }
            | Statement::Insert { table, .. }
            | Statement::Update { table, .. }
            | Statement::Delete { table, .. }
            | Statement::Select { table, .. } => table,
        }
    }
}

/// Compiles statement descriptions into SQL text.
pub trait Dialect {
    fn compile(&self, statement: &Statement) -> String;
}

/// ANSI quoting with `$n` placeholders.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnsiDialect;

impl AnsiDialect {
    fn column_list(columns: &[String]) -> String {
        columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn conditions(keys: &[String], first_param: usize) -> String {
        keys.iter()
            .enumerate()
            .map(|(i, key)| format!("{} = ${}", quote_ident(key), first_param + i))
            .collect::<Vec<_>>()
            .join(" AND ")
    }
}

impl Dialect for AnsiDialect {
    fn compile(&self, statement: &Statement) -> String {
        match statement {
            Statement::CreateTable { table, columns } => {
                let defs: Vec<String> = columns
                    .iter()
                    .map(|c| {
                        let mut def = format!("{} {}", quote_ident(&c.name), c.sql_type.sql_name());
                        if c.primary_key {
                            def.push_str(" PRIMARY KEY");
                        } else if !c.nullable {
                            def.push_str(" NOT NULL");
                        }
                        def
                    })
                    .collect();
                format!(
                    "CREATE TABLE IF NOT EXISTS {} ({})",
                    quote_ident(table),
                    defs.join(", ")
                )
            }
            Statement::DropTable { table } => {
                format!("DROP TABLE IF EXISTS {}", quote_ident(table))
            }
            Statement::Insert {
                table,
                columns,
                rows,
            } => {
                let mut sql = format!(
                    "INSERT INTO {} ({}) VALUES ",
                    quote_ident(table),
                    Self::column_list(columns)
                );
                let mut param = 1;
                for row in 0..*rows {
                    if row > 0 {
                        sql.push_str(", ");
                    }
                    let placeholders: Vec<String> = (0..columns.len())
                        .map(|_| {
                            let p = format!("${}", param);
                            param += 1;
                            p
                        })
                        .collect();
                    sql.push('(');
                    sql.push_str(&placeholders.join(", "));
                    sql.push(')');
                }
                sql
            }
            Statement::Update {
                table,
                columns,
                keys,
            } => {
                let sets: Vec<String> = columns
                    .iter()
                    .enumerate()
                    .map(|(i, c)| format!("{} = ${}", quote_ident(c), i + 1))
                    .collect();
                format!(
                    "UPDATE {} SET {} WHERE {}",
                    quote_ident(table),
                    sets.join(", "),
                    Self::conditions(keys, columns.len() + 1)
                )
            }
            Statement::Delete { table, keys } => format!(
                "DELETE FROM {} WHERE {}",
                quote_ident(table),
                Self::conditions(keys, 1)
            ),
            Statement::Select { table, columns } => format!(
                "SELECT {} FROM {}",
                Self::column_list(columns),
                quote_ident(table)
            ),
        }
    }
}

/// A synchronous backend connection.
///
/// Implementations bind `params` positionally to the compiled text.
pub trait Connection {
    /// Execute a statement, returning the number of affected rows.
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Execute a query and fetch all result rows.
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    fn begin(&mut self) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_compile_create_table() {
        let sql = AnsiDialect.compile(&Statement::CreateTable {
            table: "person".to_string(),
            columns: vec![
                ColumnDef::new("id", SqlType::BigInt).primary_key(true),
                ColumnDef::new("name", SqlType::Text),
                ColumnDef::new("nick", SqlType::Text).nullable(true),
            ],
        });
        assert_eq!(
            sql,
            "CREATE TABLE IF NOT EXISTS \"person\" (\"id\" BIGINT PRIMARY KEY, \"name\" TEXT NOT NULL, \"nick\" TEXT)"
        );
    }

    #[test]
    fn test_compile_multi_row_insert() {
        let sql = AnsiDialect.compile(&Statement::Insert {
            table: "item".to_string(),
            columns: cols(&["id", "name"]),
            rows: 2,
        });
        assert_eq!(
            sql,
            "INSERT INTO \"item\" (\"id\", \"name\") VALUES ($1, $2), ($3, $4)"
        );
    }

    #[test]
    fn test_compile_update_and_delete() {
        let update = AnsiDialect.compile(&Statement::Update {
            table: "item".to_string(),
            columns: cols(&["name", "age"]),
            keys: cols(&["id"]),
        });
        assert_eq!(
            update,
            "UPDATE \"item\" SET \"name\" = $1, \"age\" = $2 WHERE \"id\" = $3"
        );

        let delete = AnsiDialect.compile(&Statement::Delete {
            table: "student_course".to_string(),
            keys: cols(&["student_id", "course_id"]),
        });
        assert_eq!(
            delete,
            "DELETE FROM \"student_course\" WHERE \"student_id\" = $1 AND \"course_id\" = $2"
        );
    }

    #[test]
    fn test_compile_select() {
        let stmt = Statement::Select {
            table: "item".to_string(),
            columns: cols(&["id"]),
        };
        assert_eq!(stmt.table(), "item");
        assert_eq!(AnsiDialect.compile(&stmt), "SELECT \"id\" FROM \"item\"");
    }
}
