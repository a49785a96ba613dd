//! Flush operation ordering and batching.
//!
//! Pending changes are written in an order that respects foreign keys:
//! - DELETE child-first
//! - INSERT parent-first
//! - UPDATE last, in any order
//!
//! Relation table rows are ordinary operations here. Their table depends on
//! both related tables, so link rows are deleted before and inserted after
//! the objects they connect.

use std::collections::{HashMap, HashSet};

use ormstore_core::{Connection, Dialect, Result, Statement, Value};

/// A pending database operation.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingOp {
    /// Insert a new row.
    Insert {
        /// Store-local id of the object the row mirrors.
        oid: u64,
        table: String,
        columns: Vec<String>,
        values: Vec<Value>,
    },
    /// Update an existing row.
    Update {
        oid: u64,
        table: String,
        /// Columns identifying the row.
        key_columns: Vec<String>,
        key_values: Vec<Value>,
        set_columns: Vec<String>,
        set_values: Vec<Value>,
    },
    /// Delete an existing row.
    Delete {
        oid: u64,
        table: String,
        key_columns: Vec<String>,
        key_values: Vec<Value>,
    },
}

impl PendingOp {
    /// Get the table name for this operation.
    pub fn table(&self) -> &str {
        match self {
            PendingOp::Insert { table, .. }
            | PendingOp::Update { table, .. }
            | PendingOp::Delete { table, .. } => table,
        }
    }

    pub fn oid(&self) -> u64 {
        match self {
            PendingOp::Insert { oid, .. }
            | PendingOp::Update { oid, .. }
            | PendingOp::Delete { oid, .. } => *oid,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, PendingOp::Insert { .. })
    }

    pub fn is_update(&self) -> bool {
        matches!(self, PendingOp::Update { .. })
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, PendingOp::Delete { .. })
    }
}

/// Builds a dependency graph and orders operations for flush.
///
/// A table's depth is the length of its longest foreign key chain. Deeper
/// tables are deleted first and inserted last; operations on tables of equal
/// depth stay grouped by table in first-seen order.
#[derive(Debug, Default)]
pub struct FlushOrderer {
    /// Table -> tables it holds foreign keys into.
    dependencies: HashMap<String, Vec<String>>,
}

impl FlushOrderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table's dependencies.
    pub fn register_table(&mut self, table: impl Into<String>, depends_on: Vec<String>) {
        self.dependencies.insert(table.into(), depends_on);
    }

    pub fn dependencies(&self, table: &str) -> &[String] {
        self.dependencies.get(table).map_or(&[], Vec::as_slice)
    }

    /// Longest dependency chain below `table`. Cycles and self references
    /// are cut.
    pub fn depth(&self, table: &str) -> usize {
        let mut visiting = HashSet::new();
        let mut memo = HashMap::new();
        self.depth_of(table, &mut visiting, &mut memo)
    }

    fn depth_of<'a>(
        &'a self,
        table: &'a str,
        visiting: &mut HashSet<&'a str>,
        memo: &mut HashMap<&'a str, usize>,
    ) -> usize {
        if let Some(depth) = memo.get(table) {
            return *depth;
        }
        if !visiting.insert(table) {
            return 0;
        }
        let depth = self
            .dependencies(table)
            .iter()
            .filter(|dep| dep.as_str() != table)
            .map(|dep| self.depth_of(dep, visiting, memo) + 1)
            .max()
            .unwrap_or(0);
        visiting.remove(table);
        memo.insert(table, depth);
        depth
    }

    /// Order operations into a flush plan.
    pub fn order(&self, ops: Vec<PendingOp>) -> FlushPlan {
        let mut deletes = Vec::new();
        let mut inserts = Vec::new();
        let mut updates = Vec::new();

        for op in ops {
            match op {
                PendingOp::Delete { .. } => deletes.push(op),
                PendingOp::Insert { .. } => inserts.push(op),
                PendingOp::Update { .. } => updates.push(op),
            }
        }

        let mut first_seen: HashMap<String, usize> = HashMap::new();
        for op in deletes.iter().chain(&inserts) {
            let next = first_seen.len();
            first_seen.entry(op.table().to_string()).or_insert(next);
        }
        let depths: HashMap<String, usize> = first_seen
            .keys()
            .map(|table| (table.clone(), self.depth(table)))
            .collect();
        let rank = |op: &PendingOp| {
            (
                depths.get(op.table()).copied().unwrap_or(0),
                first_seen.get(op.table()).copied().unwrap_or(0),
            )
        };

        // children first
        deletes.sort_by(|a, b| {
            let (a_depth, a_seen) = rank(a);
            let (b_depth, b_seen) = rank(b);
            b_depth.cmp(&a_depth).then(a_seen.cmp(&b_seen))
        });
        // parents first
        inserts.sort_by_key(|op| rank(op));

        FlushPlan {
            deletes,
            inserts,
            updates,
        }
    }
}

/// A plan for executing flush operations.
#[derive(Debug, Default)]
pub struct FlushPlan {
    /// Delete operations (ordered child-first).
    pub deletes: Vec<PendingOp>,
    /// Insert operations (ordered parent-first).
    pub inserts: Vec<PendingOp>,
    /// Update operations (any order).
    pub updates: Vec<PendingOp>,
}

impl FlushPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.inserts.is_empty() && self.updates.is_empty()
    }

    /// Total number of operations in the plan.
    pub fn len(&self) -> usize {
        self.deletes.len() + self.inserts.len() + self.updates.len()
    }

    /// Execute the plan. With `batch_inserts` set, consecutive inserts into
    /// one table with the same columns become a single multi-row statement.
    #[tracing::instrument(level = "debug", skip(self, conn, dialect))]
    pub fn execute<C: Connection, D: Dialect>(
        &self,
        conn: &mut C,
        dialect: &D,
        batch_inserts: bool,
    ) -> Result<FlushResult> {
        tracing::info!(
            deletes = self.deletes.len(),
            inserts = self.inserts.len(),
            updates = self.updates.len(),
            "Executing flush plan"
        );

        let start = std::time::Instant::now();
        let mut result = FlushResult::default();

        for op in &self.deletes {
            result.deleted += Self::execute_delete(conn, dialect, op)?;
        }

        for batch in Self::batch_inserts(&self.inserts, batch_inserts) {
            result.inserted += Self::execute_insert_batch(conn, dialect, &batch)?;
        }

        for op in &self.updates {
            result.updated += Self::execute_update(conn, dialect, op)?;
        }

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis(),
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            "Flush complete"
        );

        Ok(result)
    }

    /// Group consecutive inserts sharing table and column list.
    fn batch_inserts(ops: &[PendingOp], enabled: bool) -> Vec<Vec<&PendingOp>> {
        let mut batches: Vec<Vec<&PendingOp>> = Vec::new();
        for op in ops {
            let PendingOp::Insert { table, columns, .. } = op else {
                continue;
            };
            let joins_last = enabled
                && batches.last().and_then(|b| b.first()).is_some_and(|first| {
                    matches!(first, PendingOp::Insert { table: t, columns: c, .. } if t == table && c == columns)
                });
            match batches.last_mut() {
                Some(batch) if joins_last => batch.push(op),
                _ => batches.push(vec![op]),
            }
        }
        batches
    }

    fn execute_insert_batch<C: Connection, D: Dialect>(
        conn: &mut C,
        dialect: &D,
        ops: &[&PendingOp],
    ) -> Result<usize> {
        let Some(PendingOp::Insert { table, columns, .. }) = ops.first() else {
            return Ok(0);
        };

        tracing::debug!(table = %table, count = ops.len(), "Executing insert batch");

        let sql = dialect.compile(&Statement::Insert {
            table: table.clone(),
            columns: columns.clone(),
            rows: ops.len(),
        });
        let mut params: Vec<Value> = Vec::with_capacity(columns.len() * ops.len());
        for op in ops {
            if let PendingOp::Insert { values, .. } = op {
                params.extend(values.iter().cloned());
            }
        }
        tracing::trace!(sql = %sql, "Executing INSERT");
        conn.execute(&sql, &params)?;
        Ok(ops.len())
    }

    fn execute_delete<C: Connection, D: Dialect>(
        conn: &mut C,
        dialect: &D,
        op: &PendingOp,
    ) -> Result<usize> {
        let PendingOp::Delete {
            table,
            key_columns,
            key_values,
            ..
        } = op
        else {
            return Ok(0);
        };

        // without a key there is no WHERE clause that names just this row
        if key_columns.is_empty() || key_values.iter().any(Value::is_null) {
            tracing::warn!(
                table = %table,
                oid = op.oid(),
                "Skipping DELETE for row without primary key - cannot identify row"
            );
            return Ok(0);
        }

        let sql = dialect.compile(&Statement::Delete {
            table: table.clone(),
            keys: key_columns.clone(),
        });
        tracing::trace!(sql = %sql, "Executing DELETE");
        conn.execute(&sql, key_values)?;
        Ok(1)
    }

    fn execute_update<C: Connection, D: Dialect>(
        conn: &mut C,
        dialect: &D,
        op: &PendingOp,
    ) -> Result<usize> {
        let PendingOp::Update {
            table,
            key_columns,
            key_values,
            set_columns,
            set_values,
            ..
        } = op
        else {
            return Ok(0);
        };

        if key_columns.is_empty() || key_values.iter().any(Value::is_null) {
            tracing::warn!(
                table = %table,
                oid = op.oid(),
                "Skipping UPDATE for row without primary key - cannot identify row"
            );
            return Ok(0);
        }

        if set_columns.is_empty() {
            return Ok(0);
        }

        tracing::debug!(table = %table, columns = ?set_columns, "Executing update");

        let sql = dialect.compile(&Statement::Update {
            table: table.clone(),
            columns: set_columns.clone(),
            keys: key_columns.clone(),
        });
        let mut params: Vec<Value> = set_values.clone();
        params.extend(key_values.iter().cloned());
        conn.execute(&sql, &params)?;
        Ok(1)
    }
}

/// Result of a flush operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushResult {
    /// Number of rows inserted.
    pub inserted: usize,
    /// Number of rows updated.
    pub updated: usize,
    /// Number of rows deleted.
    pub deleted: usize,
}

impl FlushResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of operations performed.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ormstore_core::{AnsiDialect, Row};

    #[derive(Default)]
    struct Recorder {
        statements: Vec<(String, Vec<Value>)>,
    }

    impl Connection for Recorder {
        fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
            self.statements.push((sql.to_string(), params.to_vec()));
            Ok(1)
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

    fn insert(oid: u64, table: &str, id: i64) -> PendingOp {
        PendingOp::Insert {
            oid,
            table: table.to_string(),
            columns: vec!["id".to_string()],
            values: vec![Value::BigInt(id)],
        }
    }

    fn delete(oid: u64, table: &str, id: i64) -> PendingOp {
        PendingOp::Delete {
            oid,
            table: table.to_string(),
            key_columns: vec!["id".to_string()],
            key_values: vec![Value::BigInt(id)],
        }
    }

    fn orderer() -> FlushOrderer {
        let mut orderer = FlushOrderer::new();
        orderer.register_table("teams", vec![]);
        orderer.register_table("heroes", vec!["teams".to_string()]);
        orderer.register_table(
            "hero_powers",
            vec!["heroes".to_string(), "powers".to_string()],
        );
        orderer.register_table("powers", vec![]);
        orderer
    }

    #[test]
    fn test_depth_follows_longest_chain() {
        let orderer = orderer();
        assert_eq!(orderer.depth("teams"), 0);
        assert_eq!(orderer.depth("heroes"), 1);
        assert_eq!(orderer.depth("hero_powers"), 2);
        assert_eq!(orderer.depth("unknown"), 0);
    }

    #[test]
    fn test_depth_cuts_cycles() {
        let mut orderer = FlushOrderer::new();
        orderer.register_table("a", vec!["b".to_string()]);
        orderer.register_table("b", vec!["a".to_string()]);
        orderer.register_table("tree", vec!["tree".to_string()]);
        assert!(orderer.depth("a") <= 2);
        assert_eq!(orderer.depth("tree"), 0);
    }

    #[test]
    fn test_inserts_parent_first() {
        let plan = orderer().order(vec![
            insert(1, "hero_powers", 1),
            insert(2, "heroes", 1),
            insert(3, "teams", 1),
            insert(4, "heroes", 2),
        ]);
        let tables: Vec<&str> = plan.inserts.iter().map(PendingOp::table).collect();
        assert_eq!(tables, vec!["teams", "heroes", "heroes", "hero_powers"]);
        assert_eq!(plan.inserts[1].oid(), 2);
        assert_eq!(plan.inserts[2].oid(), 4);
    }

    #[test]
    fn test_deletes_child_first() {
        let plan = orderer().order(vec![
            delete(1, "teams", 1),
            delete(2, "heroes", 1),
            delete(3, "hero_powers", 1),
        ]);
        let tables: Vec<&str> = plan.deletes.iter().map(PendingOp::table).collect();
        assert_eq!(tables, vec!["hero_powers", "heroes", "teams"]);
    }

    #[test]
    fn test_execute_batches_inserts() {
        let plan = orderer().order(vec![
            insert(1, "teams", 1),
            insert(2, "teams", 2),
            insert(3, "heroes", 1),
        ]);
        let mut conn = Recorder::default();
        let result = plan.execute(&mut conn, &AnsiDialect, true).unwrap();
        assert_eq!(result.inserted, 3);
        assert_eq!(conn.statements.len(), 2);
        assert_eq!(
            conn.statements[0].0,
            "INSERT INTO \"teams\" (\"id\") VALUES ($1), ($2)"
        );
        assert_eq!(
            conn.statements[0].1,
            vec![Value::BigInt(1), Value::BigInt(2)]
        );
    }

    #[test]
    fn test_execute_without_batching() {
        let plan = orderer().order(vec![insert(1, "teams", 1), insert(2, "teams", 2)]);
        let mut conn = Recorder::default();
        let result = plan.execute(&mut conn, &AnsiDialect, false).unwrap();
        assert_eq!(result.inserted, 2);
        assert_eq!(conn.statements.len(), 2);
    }

    #[test]
    fn test_delete_without_key_is_skipped() {
        let plan = FlushOrderer::new().order(vec![PendingOp::Delete {
            oid: 9,
            table: "teams".to_string(),
            key_columns: vec!["id".to_string()],
            key_values: vec![Value::Null],
        }]);
        let mut conn = Recorder::default();
        let result = plan.execute(&mut conn, &AnsiDialect, true).unwrap();
        assert_eq!(result.deleted, 0);
        assert!(conn.statements.is_empty());
    }

    #[test]
    fn test_update_binds_set_values_then_keys() {
        let plan = FlushOrderer::new().order(vec![PendingOp::Update {
            oid: 1,
            table: "heroes".to_string(),
            key_columns: vec!["id".to_string()],
            key_values: vec![Value::BigInt(7)],
            set_columns: vec!["name".to_string()],
            set_values: vec![Value::Text("jane".to_string())],
        }]);
        let mut conn = Recorder::default();
        let result = plan.execute(&mut conn, &AnsiDialect, true).unwrap();
        assert_eq!(result, FlushResult { inserted: 0, updated: 1, deleted: 0 });
        assert_eq!(
            conn.statements[0].0,
            "UPDATE \"heroes\" SET \"name\" = $1 WHERE \"id\" = $2"
        );
        assert_eq!(
            conn.statements[0].1,
            vec![Value::Text("jane".to_string()), Value::BigInt(7)]
        );
    }

    #[test]
    fn test_flush_result_total() {
        let result = FlushResult {
            inserted: 2,
            updated: 1,
            deleted: 3,
        };
        assert_eq!(result.total(), 6);
        assert!(FlushPlan::new().is_empty());
    }
}
