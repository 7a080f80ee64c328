//! Test fixtures for adapter integration tests
//!
//! Source tables shaped like the operational tables the pipeline typically moves.

use chrono::NaiveDate;
use stagehouse_core::{ColumnSchema, Row, Value};

fn at(day: u32, hour: u32) -> Value {
    Value::Timestamp(
        NaiveDate::from_ymd_opt(2024, 3, day)
            .and_then(|d| d.and_hms_opt(hour, 0, 0))
            .expect("valid fixture timestamp"),
    )
}

/// `dbo.users`: id, name, updated
pub fn users_columns() -> Vec<ColumnSchema> {
    vec![
        ColumnSchema::new("id", "int"),
        ColumnSchema::new("name", "varchar").with_max_length(50),
        ColumnSchema::new("updated", "datetime"),
    ]
}

pub fn users_rows() -> Vec<Row> {
    vec![
        vec![Value::Int(1), Value::from("ann"), at(1, 9)],
        vec![Value::Int(2), Value::from("bob"), at(2, 9)],
        vec![Value::Int(3), Value::Null, at(3, 9)],
    ]
}

/// `dbo.orders`: a wider table with decimals, flags and GUIDs
pub fn orders_columns() -> Vec<ColumnSchema> {
    vec![
        ColumnSchema::new("order_id", "bigint"),
        ColumnSchema::new("customer_guid", "uniqueidentifier"),
        ColumnSchema::new("total", "decimal").with_precision(10, 2),
        ColumnSchema::new("is_paid", "bit"),
        ColumnSchema::new("notes", "nvarchar").with_max_length(-1),
        ColumnSchema::new("order", "int"),
    ]
}

pub fn orders_rows() -> Vec<Row> {
    vec![
        vec![
            Value::Int(10),
            Value::from("6f1c0b6e-6a0e-4c39-9d4c-0c3d2f0f5e11"),
            Value::Text("19.99".to_string()),
            Value::Bool(true),
            Value::from("line one\nline two"),
            Value::Int(1),
        ],
        vec![
            Value::Int(11),
            Value::from("0b5a1b2e-7d5f-4a3b-8a1e-2f9d6c7e8a90"),
            Value::Text("5.00".to_string()),
            Value::Bool(false),
            Value::Null,
            Value::Int(2),
        ],
    ]
}
