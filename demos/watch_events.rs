use std::error::Error;

use semaphore_realtime::{BootstrapOutcome, ClientOptions, Credentials, SessionBootstrapper};
use tracing_subscriber::EnvFilter;
use url::Url;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let origin = std::env::var("SEMAPHORE_URL").unwrap_or_else(|_| "http://localhost:3000".into());
    let credentials = match std::env::var("SEMAPHORE_API_TOKEN") {
        Ok(token) => Credentials::api_token(token),
        Err(_) => Credentials::None,
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let mut bootstrapper = SessionBootstrapper::for_origin(
            Url::parse(&origin)?,
            credentials,
            |state: &str| println!("navigate to {state}"),
            ClientOptions::default(),
        )?;
        let mut updates = bootstrapper.subscribe("remote.update");
        let mut logs = bootstrapper.subscribe("remote.log");

        match bootstrapper.refresh_session().await {
            BootstrapOutcome::Authenticated(user) => {
                println!("signed in as {} (id={})", user.username, user.id);
            }
            BootstrapOutcome::LoginRequired(err) => {
                println!("login required: {err}");
                return Ok(());
            }
        }

        loop {
            let event = tokio::select! {
                event = updates.recv() => event,
                event = logs.recv() => event,
            };
            let Some(event) = event else {
                break;
            };
            println!("#{} {} {}", event.seq, event.key, event.envelope.to_value());
        }

        Ok::<(), Box<dyn Error>>(())
    })
}
