pub mod cache;
pub mod error;
pub mod gateway;
pub mod query;
pub mod realtime;
pub mod supabase;

pub use cache::{CacheKey, QueryCache};
pub use error::GatewayError;
pub use gateway::BackendGateway;
pub use query::{Filter, FilterOp, Order, SelectQuery, UpdateQuery};
pub use realtime::{
    BroadcastChangeFeed, ChangeEvent, ChangeEventKind, ChangeFeed, ChangeHandler, ChannelHandle,
    ChannelSpec, EventFilter, SupabaseRealtime,
};
pub use supabase::SupabaseClient;
