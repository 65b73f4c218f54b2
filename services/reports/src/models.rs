//! API models for report requests and responses

pub mod report;

pub use report::{
    Period, ProsthesisStats, Report, ReportRequest, ReportResponse, Schema, StoredReport,
};
