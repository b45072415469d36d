//! Basic session example
//!
//! Usage:
//!   SHAREHUB_USERNAME=... SHAREHUB_PASSWORD=... cargo run --example basic_session

use futures_util::StreamExt;
use sharehub_client::{
    ChatCompletionRequest, ChatMessage, ClientConfig, FileBackend, RenewalScheduler, SessionClient,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let config = ClientConfig::from_env()?;
    let username = std::env::var("SHAREHUB_USERNAME").unwrap_or_else(|_| "demo@example.com".to_string());
    let password = std::env::var("SHAREHUB_PASSWORD").unwrap_or_default();
    let credentials_path = std::env::var("SHAREHUB_CREDENTIALS")
        .unwrap_or_else(|_| std::env::temp_dir().join("sharehub-credentials.json").display().to_string());

    println!("=== ShareHub Client Example ===");
    println!("API: {}", config.base_url);
    println!();

    let client = SessionClient::with_backend(config, Arc::new(FileBackend::open(&credentials_path)?))?;

    if !client.is_authenticated() {
        println!("Logging in as {username}...");
        let login = client.login(&username, &password).await?;
        println!("✓ Logged in as {} (token valid for {}s)", login.user.username, login.tokens.expires_in);
    } else {
        println!("✓ Resumed session from {credentials_path}");
    }
    println!();

    // Renew the token in the background until the session ends
    let renewal = RenewalScheduler::start(Arc::clone(&client), || {
        eprintln!("! Session could not be renewed, please log in again");
    });

    let user = client.current_user().await?;
    println!("Current user: {} (beta: {})", user.username, user.beta);

    match client.accounts().await {
        Ok(accounts) => {
            println!("Accounts:");
            for account in accounts {
                println!(
                    "  - {} [{}] {}",
                    account.cookie_id,
                    if account.status == 1 { "enabled" } else { "disabled" },
                    account.name.unwrap_or_default()
                );
            }
        }
        Err(e) if e.is_session_expired() => {
            println!("! Session expired, please log in again");
            renewal.stop();
            return Ok(());
        }
        Err(e) => println!("! Failed to list accounts: {e}"),
    }
    println!();

    println!("Chat:");
    let request = ChatCompletionRequest::new("gemini-2.5-flash", vec![ChatMessage::user("Say hello in five words.")]);
    let mut chunks = client.chat_completion_stream(&request).await?;
    while let Some(chunk) = chunks.next().await {
        print!("{}", chunk?);
    }
    println!();

    renewal.stop();
    renewal.join().await;
    Ok(())
}
