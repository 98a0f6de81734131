mod app;
mod auth;
mod calendar;
mod config;
mod error;
mod jobs;
mod rendering;
mod slack;
mod sms;
mod store;
mod transcription;
mod types;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    app::run().await
}
