use serde::Serialize;
use tracing::warn;

use crate::types::{NotificationEvent, RunSummary};

/// One processed sale as a single JSON line on stdout.
pub fn report_notification(event: &NotificationEvent) {
    emit(&event.sale_id, to_line(event));
}

/// The end-of-run summary, pretty-printed on stdout.
pub fn report_run_summary(summary: &RunSummary) {
    emit("run summary", serde_json::to_string_pretty(summary));
}

/// Render `value` the way the stdout stream carries it.
pub fn to_line<T: Serialize>(value: &T) -> serde_json::Result<String> {
    serde_json::to_string(value)
}

fn emit(what: &str, rendered: serde_json::Result<String>) {
    match rendered {
        Ok(json) => println!("{json}"),
        // stdout is a data stream; a dropped record must still show in the log.
        Err(e) => warn!("Could not serialize {what} for stdout: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeliveryStatus;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    #[test]
    fn notification_is_one_json_line() {
        let event = NotificationEvent {
            timestamp: "2025-06-01T10:00:05+00:00".into(),
            sale_id: "nft-1_2025-06-01T10:00:00Z_12.5".into(),
            gift_name: "Plush Pepe".into(),
            gift_number: 1234,
            sale_price: dec!(12.5),
            sold_at: Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap(),
            status: DeliveryStatus::Suppressed,
            pinned: false,
        };
        let line = to_line(&event).unwrap();
        assert!(!line.contains('\n'));
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["status"], "suppressed");
        assert_eq!(value["gift_number"], 1234);
    }

    #[test]
    fn summary_counts_are_reported() {
        let summary = RunSummary {
            ticks: 4,
            sales_notified: 2,
            ..RunSummary::default()
        };
        let value: serde_json::Value = serde_json::from_str(&to_line(&summary).unwrap()).unwrap();
        assert_eq!(value["ticks"], 4);
        assert_eq!(value["sales_notified"], 2);
    }
}
