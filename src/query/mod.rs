//! Query pipeline
//!
//! Raw request parameters flow through four stages:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                    QueryParams                       │
//! │   field=sum(session)&groupBy=environment&query=...   │
//! └──────────────────────────────────────────────────────┘
//!                          │ parse + validate
//!                          ▼
//! ┌──────────────────────────────────────────────────────┐
//! │                  QueryDefinition                     │
//! │  fields, group-by, filter tree, order-by, window     │
//! └──────────────────────────────────────────────────────┘
//!                          │ compile (per entity)
//!                          ▼
//! ┌──────────────────────────────────────────────────────┐
//! │             QueryBuilder → EntityQueries             │
//! │        totals query + optional series query          │
//! └──────────────────────────────────────────────────────┘
//!                          │ execute + convert
//!                          ▼
//! ┌──────────────────────────────────────────────────────┐
//! │            ResultConverter → GroupResult             │
//! │   dense, gap-filled series keyed by tag combination  │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod compiler;
pub mod converter;
pub mod definition;
pub mod filter;

pub use compiler::{EntityQueries, QueryBuilder};
pub use converter::{EntityResults, ResultConverter};
pub use definition::{MetricField, OrderSpec, QueryDefinition, QueryParams};
pub use filter::{FilterExpr, TagCondition};
