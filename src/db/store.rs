// Generic typed create/update/find primitives over a single table.
// Booleans and string lists are converted here so callers only see native types.

use sqlx::sqlite::{Sqlite, SqliteRow};
use sqlx::{QueryBuilder, SqlitePool};
use std::marker::PhantomData;

use crate::error::{Error, Result};
use crate::models::{MediaType, SeenDateSource, StringList};

/// A column value crossing the store boundary
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Bool(bool),
    List(StringList),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<StringList> for Value {
    fn from(v: StringList) -> Self {
        Value::List(v)
    }
}

impl From<MediaType> for Value {
    fn from(v: MediaType) -> Self {
        Value::Text(v.as_str().to_string())
    }
}

impl From<SeenDateSource> for Value {
    fn from(v: SeenDateSource) -> Self {
        Value::Text(v.as_str().to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Bind a value onto a query under construction
pub fn push_value(qb: &mut QueryBuilder<'_, Sqlite>, value: Value) {
    match value {
        Value::Null => {
            qb.push("NULL");
        }
        Value::Integer(v) => {
            qb.push_bind(v);
        }
        Value::Real(v) => {
            qb.push_bind(v);
        }
        Value::Text(v) => {
            qb.push_bind(v);
        }
        Value::Bool(v) => {
            qb.push_bind(if v { 1_i64 } else { 0_i64 });
        }
        Value::List(v) => {
            qb.push_bind(v.to_column());
        }
    }
}

/// Append `AND column = value` terms; a Null value matches `IS NULL`
pub fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: Vec<(&'static str, Value)>) {
    for (column, value) in filter {
        qb.push(" AND ").push(column);
        if value == Value::Null {
            qb.push(" IS NULL");
        } else {
            qb.push(" = ");
            push_value(qb, value);
        }
    }
}

/// A row type stored in a single table keyed by an integer `id`
pub trait Entity: for<'r> sqlx::FromRow<'r, SqliteRow> + Send + Unpin {
    const TABLE: &'static str;
    const PRIMARY_KEY: &'static str = "id";

    fn id(&self) -> Option<i64>;

    /// Non-key columns and their values
    fn values(&self) -> Vec<(&'static str, Value)>;

    /// Columns an update may write. Columns fixed at creation or owned by
    /// another writer are left out.
    fn update_values(&self) -> Vec<(&'static str, Value)> {
        self.values()
    }
}

pub struct Store<E> {
    pool: SqlitePool,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for Store<E> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E> std::fmt::Debug for Store<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("entity", &std::any::type_name::<E>())
            .finish()
    }
}

impl<E: Entity> Store<E> {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            _entity: PhantomData,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a row and return its id. An explicit id on the entity is kept.
    pub async fn create(&self, entity: &E) -> Result<i64> {
        let mut columns: Vec<&'static str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(id) = entity.id() {
            columns.push(E::PRIMARY_KEY);
            values.push(Value::Integer(id));
        }
        for (column, value) in entity.values() {
            columns.push(column);
            values.push(value);
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("INSERT INTO ");
        qb.push(E::TABLE)
            .push(" (")
            .push(columns.join(", "))
            .push(") VALUES (");
        for (i, value) in values.into_iter().enumerate() {
            if i > 0 {
                qb.push(", ");
            }
            push_value(&mut qb, value);
        }
        qb.push(")");

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.last_insert_rowid())
    }

    /// Overwrite the updatable columns of an existing row
    pub async fn update(&self, entity: &E) -> Result<()> {
        let id = entity.id().ok_or_else(|| {
            Error::validation(format!("cannot update {} without an id", E::TABLE))
        })?;

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE ");
        qb.push(E::TABLE).push(" SET ");
        for (i, (column, value)) in entity.update_values().into_iter().enumerate() {
            if i > 0 {
                qb.push(", ");
            }
            qb.push(column).push(" = ");
            push_value(&mut qb, value);
        }
        qb.push(" WHERE ")
            .push(E::PRIMARY_KEY)
            .push(" = ")
            .push_bind(id);

        let result = qb.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound { table: E::TABLE, id });
        }
        Ok(())
    }

    pub async fn find(&self, filter: Vec<(&'static str, Value)>) -> Result<Vec<E>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM ");
        qb.push(E::TABLE).push(" WHERE 1=1");
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY ").push(E::PRIMARY_KEY);

        Ok(qb.build_query_as::<E>().fetch_all(&self.pool).await?)
    }

    pub async fn find_one(&self, filter: Vec<(&'static str, Value)>) -> Result<Option<E>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM ");
        qb.push(E::TABLE).push(" WHERE 1=1");
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY ").push(E::PRIMARY_KEY).push(" LIMIT 1");

        Ok(qb.build_query_as::<E>().fetch_optional(&self.pool).await?)
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<E>> {
        self.find_one(vec![(E::PRIMARY_KEY, id.into())]).await
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("DELETE FROM ");
        qb.push(E::TABLE)
            .push(" WHERE ")
            .push(E::PRIMARY_KEY)
            .push(" = ")
            .push_bind(id);

        let result = qb.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound { table: E::TABLE, id });
        }
        Ok(())
    }

    pub async fn count(&self, filter: Vec<(&'static str, Value)>) -> Result<i64> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT COUNT(*) FROM ");
        qb.push(E::TABLE).push(" WHERE 1=1");
        push_filter(&mut qb, filter);

        let (count,): (i64,) = qb.build_query_as().fetch_one(&self.pool).await?;
        Ok(count)
    }
}
