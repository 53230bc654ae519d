//! Transfer progress display with progress bars.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use shario_core::transfer::{Transfer, TransferId, TransferStatus};
use std::collections::HashMap;

/// One progress bar per in-flight transfer.
pub struct TransferProgress {
    multi: MultiProgress,
    bars: HashMap<TransferId, ProgressBar>,
}

impl TransferProgress {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
        }
    }

    /// Fold a transfer snapshot into the display.
    pub fn update(&mut self, transfer: &Transfer) {
        let bar = self.bars.entry(transfer.id).or_insert_with(|| {
            let bar = self.multi.add(ProgressBar::new(transfer.size));
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{msg}\n  [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
                    .expect("Invalid progress bar template")
                    .progress_chars("#>-"),
            );
            let verb = match transfer.direction {
                shario_core::transfer::Direction::Send => "Sending",
                shario_core::transfer::Direction::Receive => "Receiving",
            };
            bar.set_message(format!("{verb}: {}", transfer.filename));
            bar
        });

        bar.set_position(transfer.bytes_transferred);

        match transfer.status {
            TransferStatus::Completed => {
                bar.finish_with_message(format!("Done: {}", transfer.filename));
                self.bars.remove(&transfer.id);
            }
            TransferStatus::Failed => {
                let reason = transfer.error.as_deref().unwrap_or("unknown error");
                bar.abandon_with_message(format!("Failed: {} ({reason})", transfer.filename));
                self.bars.remove(&transfer.id);
            }
            TransferStatus::Cancelled => {
                bar.abandon_with_message(format!("Cancelled: {}", transfer.filename));
                self.bars.remove(&transfer.id);
            }
            TransferStatus::Pending | TransferStatus::Active => {}
        }
    }
}

impl Default for TransferProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// Format bytes in human-readable form.
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
