use std::time::Duration;

use fetchline::{Delay, FetchOptions, Fetcher, ReqwestTransport, RetryContext, RetryOptions};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let defaults = FetchOptions::from_env()
        .map_err(anyhow::Error::msg)?
        .retry(
            RetryOptions::new()
                .attempts(3)
                .delay(Delay::with(|ctx: &RetryContext<'_>| {
                    Duration::from_millis(200 * 2u64.pow(ctx.attempt))
                })),
        )
        .on_retry(|ctx: &RetryContext<'_>| {
            println!("retry #{} for {}", ctx.attempt + 1, ctx.request.url);
        });

    let api = Fetcher::new(ReqwestTransport::new()).with_defaults(defaults);

    let todo = api
        .execute("/todos/1", FetchOptions::new().param("verbose", true))
        .await?;
    println!("{todo:#}");

    Ok(())
}
