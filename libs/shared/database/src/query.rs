use std::cmp::Ordering;

use serde_json::Value;

/// Predicate on a single column, rendered as a PostgREST filter.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterOp {
    Eq(Value),
    In(Vec<Value>),
    NotNull,
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self { column: column.into(), op: FilterOp::Eq(value.into()) }
    }

    pub fn in_list<V: Into<Value>>(column: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Self {
            column: column.into(),
            op: FilterOp::In(values.into_iter().map(Into::into).collect()),
        }
    }

    pub fn not_null(column: impl Into<String>) -> Self {
        Self { column: column.into(), op: FilterOp::NotNull }
    }

    /// `column=operator.value` pair for a PostgREST query string.
    pub fn to_query_pair(&self) -> String {
        let rendered = match &self.op {
            FilterOp::Eq(value) => format!("eq.{}", encode_value(value)),
            FilterOp::In(values) => {
                let items: Vec<String> = values.iter().map(encode_value).collect();
                format!("in.({})", items.join(","))
            }
            FilterOp::NotNull => "not.is.null".to_string(),
        };
        format!("{}={}", self.column, rendered)
    }

    /// Evaluates the predicate against a row held in memory.
    pub fn matches(&self, row: &Value) -> bool {
        let field = row.get(&self.column).unwrap_or(&Value::Null);
        match &self.op {
            FilterOp::Eq(value) => values_equal(field, value),
            FilterOp::In(values) => values.iter().any(|v| values_equal(field, v)),
            FilterOp::NotNull => !field.is_null(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
    pub nulls_last: bool,
    /// Orders an embedded resource instead of the top-level rows.
    pub referenced_table: Option<String>,
}

impl Order {
    pub fn asc(column: impl Into<String>) -> Self {
        Self { column: column.into(), ascending: true, nulls_last: false, referenced_table: None }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self { column: column.into(), ascending: false, nulls_last: false, referenced_table: None }
    }

    pub fn nulls_last(mut self) -> Self {
        self.nulls_last = true;
        self
    }

    pub fn on_table(mut self, table: impl Into<String>) -> Self {
        self.referenced_table = Some(table.into());
        self
    }

    fn to_query_pair(&self) -> String {
        let key = match &self.referenced_table {
            Some(table) => format!("{}.order", table),
            None => "order".to_string(),
        };
        let direction = if self.ascending { "asc" } else { "desc" };
        let nulls = if self.nulls_last { ".nullslast" } else { "" };
        format!("{}={}.{}{}", key, self.column, direction, nulls)
    }

    /// Null placement follows Postgres defaults unless `nulls_last` is set:
    /// nulls sort as larger than any value.
    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        let left = a.get(&self.column).unwrap_or(&Value::Null);
        let right = b.get(&self.column).unwrap_or(&Value::Null);

        match (left.is_null(), right.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) if self.nulls_last => Ordering::Greater,
            (false, true) if self.nulls_last => Ordering::Less,
            (true, false) => if self.ascending { Ordering::Greater } else { Ordering::Less },
            (false, true) => if self.ascending { Ordering::Less } else { Ordering::Greater },
            (false, false) => {
                let ord = compare_values(left, right);
                if self.ascending { ord } else { ord.reverse() }
            }
        }
    }
}

/// Row read against one table: column and embed list, filters, ordering and limit.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    pub table: String,
    pub columns: String,
    pub filters: Vec<Filter>,
    pub order: Vec<Order>,
    pub limit: Option<usize>,
}

impl SelectQuery {
    pub fn from(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: "*".to_string(),
            filters: Vec::new(),
            order: Vec::new(),
            limit: None,
        }
    }

    /// Column list, including embedded resources such as `*, patients (id, hn)`.
    /// Whitespace is stripped before it goes on the wire.
    pub fn columns(mut self, columns: &str) -> Self {
        self.columns = columns.chars().filter(|c| !c.is_whitespace()).collect();
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn eq(self, column: &str, value: impl Into<Value>) -> Self {
        self.filter(Filter::eq(column, value))
    }

    pub fn order(mut self, order: Order) -> Self {
        self.order.push(order);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn to_query_string(&self) -> String {
        let mut parts = vec![format!("select={}", self.columns)];
        parts.extend(self.filters.iter().map(Filter::to_query_pair));
        parts.extend(self.order.iter().map(Order::to_query_pair));
        if let Some(limit) = self.limit {
            parts.push(format!("limit={}", limit));
        }
        parts.join("&")
    }

    pub fn path(&self) -> String {
        format!("/rest/v1/{}?{}", self.table, self.to_query_string())
    }

    pub fn matches(&self, row: &Value) -> bool {
        self.filters.iter().all(|f| f.matches(row))
    }

    /// Applies filters, top-level ordering and limit to rows held in memory.
    pub fn apply(&self, rows: impl IntoIterator<Item = Value>) -> Vec<Value> {
        let mut selected: Vec<Value> = rows.into_iter().filter(|r| self.matches(r)).collect();

        let top_level: Vec<&Order> = self.order.iter().filter(|o| o.referenced_table.is_none()).collect();
        if !top_level.is_empty() {
            selected.sort_by(|a, b| {
                top_level
                    .iter()
                    .map(|o| o.compare(a, b))
                    .find(|ord| *ord != Ordering::Equal)
                    .unwrap_or(Ordering::Equal)
            });
        }

        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }
        selected
    }
}

/// Row update scoped by filters. An update with no filters is refused by the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateQuery {
    pub table: String,
    pub filters: Vec<Filter>,
}

impl UpdateQuery {
    pub fn table(table: impl Into<String>) -> Self {
        Self { table: table.into(), filters: Vec::new() }
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::eq(column, value));
        self
    }

    pub fn path(&self) -> String {
        let filters: Vec<String> = self.filters.iter().map(Filter::to_query_pair).collect();
        format!("/rest/v1/{}?{}", self.table, filters.join("&"))
    }

    pub fn matches(&self, row: &Value) -> bool {
        self.filters.iter().all(|f| f.matches(row))
    }
}

fn encode_value(value: &Value) -> String {
    match value {
        Value::String(s) => urlencoding::encode(s).into_owned(),
        Value::Null => "null".to_string(),
        other => urlencoding::encode(&other.to_string()).into_owned(),
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::String(a), Value::Number(b)) | (Value::Number(b), Value::String(a)) => {
            a.parse::<f64>().ok() == b.as_f64()
        }
        _ => left == right,
    }
}

fn compare_values(left: &Value, right: &Value) -> Ordering {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        _ => left.to_string().cmp(&right.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_postgrest_query_string() {
        let query = SelectQuery::from("visits")
            .columns("*, patients ( id, hn, first_name )")
            .eq("visit_date", "2026-10-17")
            .filter(Filter::in_list("status", ["InQueue", "VitalSigns"]))
            .order(Order::asc("queue_number"));

        assert_eq!(
            query.to_query_string(),
            "select=*,patients(id,hn,first_name)&visit_date=eq.2026-10-17&status=in.(InQueue,VitalSigns)&order=queue_number.asc"
        );
    }

    #[test]
    fn renders_max_lookup_and_embedded_order() {
        let max = SelectQuery::from("visits")
            .columns("queue_number")
            .eq("visit_date", "2026-10-17")
            .filter(Filter::not_null("queue_number"))
            .order(Order::desc("queue_number").nulls_last())
            .limit(1);
        assert_eq!(
            max.path(),
            "/rest/v1/visits?select=queue_number&visit_date=eq.2026-10-17&queue_number=not.is.null&order=queue_number.desc.nullslast&limit=1"
        );

        let detail = SelectQuery::from("patients")
            .eq("id", "p1")
            .order(Order::desc("visit_date").on_table("visits"));
        assert_eq!(detail.to_query_string(), "select=*&id=eq.p1&visits.order=visit_date.desc");
    }

    #[test]
    fn encodes_values() {
        let query = SelectQuery::from("patients").eq("first_name", "สมชาย ใจดี");
        assert!(!query.to_query_string().contains(' '));
    }

    #[test]
    fn applies_filters_order_and_limit_in_memory() {
        let rows = vec![
            json!({"id": 1, "visit_date": "2026-10-17", "queue_number": 2}),
            json!({"id": 2, "visit_date": "2026-10-17", "queue_number": null}),
            json!({"id": 3, "visit_date": "2026-10-17", "queue_number": 5}),
            json!({"id": 4, "visit_date": "2026-10-16", "queue_number": 9}),
        ];

        let query = SelectQuery::from("visits")
            .eq("visit_date", "2026-10-17")
            .order(Order::desc("queue_number").nulls_last())
            .limit(1);

        let result = query.apply(rows.clone());
        assert_eq!(result, vec![rows[2].clone()]);

        let ascending = SelectQuery::from("visits")
            .eq("visit_date", "2026-10-17")
            .order(Order::asc("queue_number"))
            .apply(rows);
        let ids: Vec<i64> = ascending.iter().map(|r| r["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![1, 3, 2]);
    }

    #[test]
    fn in_filter_and_not_null() {
        let row = json!({"status": "InQueue", "queue_number": null});
        assert!(Filter::in_list("status", ["Completed", "InQueue"]).matches(&row));
        assert!(!Filter::not_null("queue_number").matches(&row));
        assert!(!Filter::eq("status", "Completed").matches(&row));
    }
}
