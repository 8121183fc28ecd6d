#![allow(dead_code)]

use iql_core::{Document, EngineConfig, Field, GroupKey, InMemorySession, ResultTable};

/// Six page views across two countries and three browsers.
pub fn traffic_docs() -> Vec<Document> {
    [
        ("US", "chrome", 10),
        ("US", "chrome", 20),
        ("US", "firefox", 30),
        ("UK", "chrome", 40),
        ("UK", "safari", 50),
        ("UK", "chrome", 60),
    ]
    .into_iter()
    .map(|(country, browser, latency)| {
        Document::new()
            .with_str("country", country)
            .with_str("browser", browser)
            .with_int("latency", latency)
    })
    .collect()
}

pub fn traffic_session() -> InMemorySession {
    InMemorySession::new(traffic_docs(), &EngineConfig::default())
}

pub fn country() -> Field {
    Field::string("country")
}

pub fn browser() -> Field {
    Field::string("browser")
}

pub fn latency() -> Field {
    Field::int("latency")
}

pub fn key(terms: &[&str]) -> GroupKey {
    terms
        .iter()
        .fold(GroupKey::root(), |key, term| key.add(*term))
}

/// `key => values` per row, in row order.
pub fn rows(table: &ResultTable) -> Vec<(String, Vec<f64>)> {
    table
        .rows
        .iter()
        .map(|row| (row.key.to_string(), row.values.clone()))
        .collect()
}
