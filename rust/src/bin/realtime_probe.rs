use std::time::{Duration, Instant};

use cognito_core::backend::{RealtimeEvent, RealtimeTransport, Topic, WsTransport};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
    cognito_core::init_rustls_crypto_provider();

    let usage = "usage: realtime_probe <ws_url> <group_id> [--api-key K] [--access-token T] [--secs N]";
    let mut args = std::env::args().skip(1);
    let url = args.next().ok_or_else(|| anyhow::anyhow!(usage))?;
    let group_id = args.next().ok_or_else(|| anyhow::anyhow!(usage))?;

    let mut api_key = String::new();
    let mut access_token = None;
    let mut secs: u64 = 30;
    while let Some(a) = args.next() {
        if a == "--api-key" {
            api_key = args
                .next()
                .ok_or_else(|| anyhow::anyhow!("--api-key requires a value"))?;
            continue;
        }
        if a == "--access-token" {
            access_token = Some(
                args.next()
                    .ok_or_else(|| anyhow::anyhow!("--access-token requires a value"))?,
            );
            continue;
        }
        if a == "--secs" {
            let n = args
                .next()
                .ok_or_else(|| anyhow::anyhow!("--secs requires a number"))?;
            secs = n.parse()?;
            continue;
        }
        return Err(anyhow::anyhow!("unknown arg: {a}"));
    }

    let transport = WsTransport::new(&url, api_key)?.with_access_token(access_token);
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let (sink, events) = flume::unbounded::<RealtimeEvent>();
        let topic = Topic::Group {
            group_id: group_id.clone(),
        };
        let started = Instant::now();
        let handle = transport
            .subscribe(topic, sink)
            .await
            .map_err(|e| anyhow::anyhow!("subscribe failed: {e}"))?;
        println!(
            "joined {} in {}ms; listening for {secs}s",
            handle.topic,
            started.elapsed().as_millis()
        );

        let deadline = tokio::time::sleep(Duration::from_secs(secs));
        tokio::pin!(deadline);
        let mut seen = 0usize;
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                ev = events.recv_async() => match ev {
                    Ok(RealtimeEvent::MessageInserted(row)) => {
                        seen += 1;
                        println!(
                            "insert id={} user={} at={} content={:?} media={:?}",
                            row.id, row.user_id, row.created_at, row.content, row.media_url
                        );
                    }
                    Ok(other) => println!("event {other:?}"),
                    Err(_) => {
                        println!("channel closed by server");
                        break;
                    }
                },
            }
        }

        transport.unsubscribe(handle).await;
        println!("done: {seen} insert(s)");
        anyhow::Ok(())
    })
}
