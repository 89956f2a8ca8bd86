//! Reddit listing API client.

mod client;
pub mod models;

pub use client::{ListError, ListingClient, Page, RedditClient};
