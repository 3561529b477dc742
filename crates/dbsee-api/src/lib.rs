pub mod auth;
pub mod client;
pub mod config;
pub mod render;
pub mod search;
pub mod stream;
pub mod system;
pub mod tables;

pub use auth::{
    AuthArgs, AuthChange, AuthCommand, AuthEvents, AuthTokens, Subscription, TokenStore,
    execute as execute_auth, login, logout, status,
};
pub use client::{ApiClient, ApiError};
pub use config::ApiConfig;
pub use search::{
    CigSearchResult, CompanyResult, SearchArgs, SearchCommand, TablesWithCig,
    execute as execute_search, search_cig, search_company, search_company_direct,
    tables_with_cig,
};
pub use stream::{
    BroadSearch, Completed, DirectSearch, SearchObserver, SearchRequest, Settlement,
    StreamConsumer, StreamError,
};
pub use system::{HealthArgs, HealthCheck, execute as execute_health, health};
pub use tables::{
    QueryFilters, QueryResult, TableSchema, TablesArgs, execute as execute_tables, list_tables,
    query_table, table_data, table_schema,
};
