//! Rows exchanged with a [`Connection`](crate::Connection).

use crate::value::Value;

/// One row of a result set: column names paired with their values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    names: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    /// Pair `names` with `values`. Surplus entries on either side are
    /// unreachable by name.
    pub fn new(names: Vec<String>, values: Vec<Value>) -> Self {
        Self { names, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Value of the first column called `name`.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.names
            .iter()
            .position(|column| column == name)
            .and_then(|index| self.values.get(index))
    }

    /// (column, value) pairs in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.names.iter().map(String::as_str).zip(self.values.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_name_and_index() {
        let row = Row::new(
            vec!["id".to_string(), "name".to_string()],
            vec![Value::BigInt(1), Value::Text("george".to_string())],
        );
        assert_eq!(row.len(), 2);
        assert_eq!(row.get_by_name("id"), Some(&Value::BigInt(1)));
        assert_eq!(row.get(1), Some(&Value::Text("george".to_string())));
        assert!(row.get_by_name("missing").is_none());

        let pairs: Vec<_> = row.iter().map(|(name, _)| name).collect();
        assert_eq!(pairs, vec!["id", "name"]);
    }

    #[test]
    fn test_short_value_list() {
        let row = Row::new(vec!["a".to_string(), "b".to_string()], vec![Value::Int(1)]);
        assert_eq!(row.get_by_name("a"), Some(&Value::Int(1)));
        assert!(row.get_by_name("b").is_none());
        assert!(!row.is_empty());
    }
}
