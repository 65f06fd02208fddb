//! Values stored by the benchmark workloads and the range predicate used to
//! query them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Width of one salary step between consecutive populated records.
pub const SALARY_STEP: f64 = 1000.0;

/// Person-like record queried by the range workloads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: u64,
    pub first_name: String,
    pub last_name: String,
    pub salary: f64,
}

impl Record {
    pub fn new(
        id: u64,
        first_name: impl Into<String>,
        last_name: impl Into<String>,
        salary: f64,
    ) -> Self {
        Self {
            id,
            first_name: first_name.into(),
            last_name: last_name.into(),
            salary,
        }
    }

    /// Deterministic record for a populated index: `salary = index * 1000`.
    pub fn for_index(index: u64) -> Self {
        Self::new(
            index,
            format!("firstName{index}"),
            format!("lastName{index}"),
            index as f64 * SALARY_STEP,
        )
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Record [id={}, firstName={}, lastName={}, salary={}]",
            self.id, self.first_name, self.last_name, self.salary
        )
    }
}

/// A cache value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    /// Plain integer payload (bulk puts write `key -> key`).
    Int(i64),
    /// Small payload written by the transactional workloads.
    Sample { id: u64 },
    Record(Record),
}

impl Value {
    pub fn sample(id: u64) -> Self {
        Value::Sample { id }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Value::Record(record) => Some(record),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// Numeric record attribute a range predicate can filter on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryField {
    Id,
    Salary,
}

impl QueryField {
    pub fn value_of(self, record: &Record) -> f64 {
        match self {
            QueryField::Id => record.id as f64,
            QueryField::Salary => record.salary,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QueryField::Id => "id",
            QueryField::Salary => "salary",
        }
    }
}

impl FromStr for QueryField {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "id" => Ok(QueryField::Id),
            "salary" => Ok(QueryField::Salary),
            other => anyhow::bail!("unknown query field {other:?}"),
        }
    }
}

/// Half-open interval predicate `min <= field < max`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RangePredicate {
    pub field: QueryField,
    pub min: f64,
    pub max: f64,
}

impl RangePredicate {
    pub fn salary(min: f64, max: f64) -> Self {
        Self {
            field: QueryField::Salary,
            min,
            max,
        }
    }

    pub fn matches(&self, record: &Record) -> bool {
        let value = self.field.value_of(record);
        value >= self.min && value < self.max
    }
}

impl fmt::Display for RangePredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in [{}, {})", self.field.as_str(), self.min, self.max)
    }
}
