pub mod feed;

pub use feed::NotificationFeed;
