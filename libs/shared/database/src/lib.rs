pub mod memory;
pub mod retry;
pub mod store;
pub mod supabase;

pub use memory::InMemoryStore;
pub use retry::RetryPolicy;
pub use store::*;
pub use supabase::SupabaseStore;
