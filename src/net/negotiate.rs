//! Terminal capability negotiation
//!
//! Once per epoch the first session is asked for its window size in pixels.
//! The reply arrives on the session's inbound stream, where the input
//! decoder recognises it and hands it over through a oneshot channel.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::aquarium::state::{GridSize, TerminalCapability};
use crate::net::input::PixelReport;
use crate::net::sink::Outbound;
use crate::net::terminal::PIXEL_SIZE_QUERY;

/// Query the terminal and wait for its pixel-size report.
///
/// Resolves to the derived capability on a report, to
/// [`TerminalCapability::DEFAULT`] on timeout or when the report channel is
/// dropped (the session left), and to `None` when the epoch is cancelled.
/// Whichever branch wins, the others are dropped with the select.
pub async fn negotiate(
    outbound: &Outbound,
    grid: GridSize,
    reports: oneshot::Receiver<PixelReport>,
    timeout: Duration,
    cancel: CancellationToken,
) -> Option<TerminalCapability> {
    if let Err(e) = outbound.try_send(Bytes::from_static(PIXEL_SIZE_QUERY)) {
        debug!("Pixel size query not queued: {}", e);
    }

    tokio::select! {
        biased;

        _ = cancel.cancelled() => {
            debug!("Negotiation cancelled with its epoch");
            None
        }
        report = reports => match report {
            Ok(report) => {
                let capability =
                    TerminalCapability::from_pixel_report(grid, report.width, report.height);
                info!(
                    "Terminal reported {}x{} px, cells are {}x{} px",
                    report.width, report.height, capability.cell_width, capability.cell_height
                );
                Some(capability)
            }
            Err(_) => {
                info!("Negotiating session left, using default terminal capability");
                Some(TerminalCapability::DEFAULT)
            }
        },
        _ = tokio::time::sleep(timeout) => {
            info!("No pixel size report after {:?}, using default terminal capability", timeout);
            Some(TerminalCapability::DEFAULT)
        }
    }
}
