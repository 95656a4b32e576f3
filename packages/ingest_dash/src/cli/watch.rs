//! `ingest watch`: print the live event stream.

use anyhow::{Context as _, Result};
use job_feed::{EventKind, ServerEvent, Subscription, handler};
use tokio::sync::mpsc;

use super::Context;
use super::render::event_line;

/// Print every event of `kinds` (all kinds when empty), optionally only those
/// about `job_id`, until Ctrl-C.
pub async fn watch_command(ctx: &Context, kinds: Vec<EventKind>, job_id: Option<String>) -> Result<()> {
    let transport = ctx.open_feed().await;
    let kinds = if kinds.is_empty() {
        EventKind::ALL.to_vec()
    } else {
        kinds
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let subscriptions: Vec<Subscription> = kinds
        .iter()
        .map(|kind| {
            let tx = tx.clone();
            let job_id = job_id.clone();
            transport.on(
                *kind,
                handler(move |event| {
                    let wanted = match (&job_id, event.job_key()) {
                        (None, _) => true,
                        (Some(want), Some((id, _))) => want == id,
                        // connected / paused / resumed are not job events
                        (Some(_), None) => !matches!(event, ServerEvent::Connected),
                    };
                    if wanted {
                        let _ = tx.send(event.clone());
                    }
                }),
            )
        })
        .collect();
    drop(tx);

    let mut status = transport.watch_status();
    eprintln!("[ingest: watching {}, Ctrl-C to stop]", ctx.feed.transport.url);

    loop {
        tokio::select! {
            Some(event) = rx.recv() => println!("{}", event_line(&event)),
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                eprintln!("[ingest: feed {current}]");
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                break;
            }
        }
    }

    for subscription in subscriptions {
        subscription.unsubscribe();
    }
    transport.close().await;
    Ok(())
}
