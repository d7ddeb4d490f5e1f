use std::time::Duration;

use runtime_flags::{ClientConfig, EvaluationContext, FlagEvent};

pub fn main() -> Result<(), runtime_flags::Error> {
    env_logger::init();

    let api_key = std::env::var("FLAGS_API_KEY").unwrap_or_default();
    let mut config = ClientConfig::from_api_key(api_key)
        .with_polling_interval(Duration::from_secs(10))
        .with_event_listener(|event: &FlagEvent| match event {
            FlagEvent::Change(change) => println!("flag {} changed: {:?}", change.key, change.kind()),
            FlagEvent::Error(err) => eprintln!("poll failed: {err}"),
            FlagEvent::Failed(err) => eprintln!("polling stopped: {err}"),
        });
    if let Ok(base_url) = std::env::var("FLAGS_BASE_URL") {
        config = config.with_base_url(base_url);
    }

    // Start polling. Until the first poll succeeds, every flag evaluates to its fallback.
    let client = config.to_client()?;

    client.wait_until_ready(Some(Duration::from_secs(5)))?;

    let context = EvaluationContext::new().with_user_id("test-user");
    println!(
        "new-checkout: {}",
        client.is_enabled("new-checkout", Some(&context))
    );
    println!("all flags: {:?}", client.get_all_flags(Some(&context)));
    println!("stats: {:?}", client.get_stats());

    client.shutdown()
}
