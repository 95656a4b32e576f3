//! `ingest run-now | retry | cancel | pause | resume`.

use anyhow::{Result, bail};
use job_feed::{ControlOutcome, ControlRequest, ConnectionStatus, send_request};

use super::Context;
use super::render::event_line;

pub async fn control_command(ctx: &Context, request: ControlRequest) -> Result<()> {
    let transport = ctx.open_feed().await;
    if transport.status() != ConnectionStatus::Online {
        transport.close().await;
        bail!(
            "feed at {} is not reachable; {} was not sent",
            ctx.feed.transport.url,
            request.command().name()
        );
    }

    let outcome = send_request(&transport, &request, ctx.feed.ack_timeout).await;
    transport.close().await;

    match outcome {
        ControlOutcome::Sent => {
            println!("{} sent", request.command().name());
            Ok(())
        }
        ControlOutcome::Confirmed(event) => {
            println!("{}", event_line(&event));
            Ok(())
        }
        ControlOutcome::Unconfirmed => {
            eprintln!(
                "[ingest: {} sent, no acknowledgement within {:?}]",
                request.command().name(),
                ctx.feed.ack_timeout
            );
            Ok(())
        }
        ControlOutcome::Dropped => bail!("feed went offline; {} was not sent", request.command().name()),
    }
}
