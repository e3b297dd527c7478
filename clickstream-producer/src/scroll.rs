//! Turn raw scroll positions into clickstream events.
use serde_json::json;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use clickstream_common::event::Event;

use crate::producer::Measure;

/// Scroll position of the page as reported by the viewport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScrollSignal {
    pub scroll_top: u32,
    pub scroll_height: u32,
}

/// Measures scroll depth on a single page for a single reader.
pub struct ScrollMeasure {
    page_url: String,
    client_height: u32,
    partition_key: String,
}

impl ScrollMeasure {
    pub fn new(page_url: &str, client_height: u32, identity_id: &str) -> Self {
        Self {
            page_url: page_url.to_owned(),
            client_height,
            partition_key: format!("partition-{}", identity_id),
        }
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }
}

fn percentage(offset: u32, height: u32) -> u64 {
    if height == 0 {
        return 0;
    }

    (offset as f64 / height as f64 * 100.0).round() as u64
}

impl Measure<ScrollSignal> for ScrollMeasure {
    fn measure(&self, signal: ScrollSignal, observed_at: OffsetDateTime) -> Event {
        let top = percentage(signal.scroll_top, signal.scroll_height);
        let bottom = percentage(
            signal.scroll_top.saturating_add(self.client_height),
            signal.scroll_height,
        );
        let time = observed_at.format(&Rfc3339).unwrap_or_default();

        Event::new(
            json!({
                "blog": self.page_url,
                "scrollTopPercentage": top,
                "scrollBottomPercentage": bottom,
                "time": time,
            }),
            &self.partition_key,
            observed_at,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn computes_rounded_percentages() {
        let measure = ScrollMeasure::new("https://example.com/post", 900, "abc");
        let event = measure.measure(
            ScrollSignal {
                scroll_top: 1000,
                scroll_height: 3000,
            },
            datetime!(2024-03-01 12:30:00 UTC),
        );

        assert_eq!(event.partition_key(), "partition-abc");
        assert_eq!(event.payload()["blog"], "https://example.com/post");
        assert_eq!(event.payload()["scrollTopPercentage"], 33);
        assert_eq!(event.payload()["scrollBottomPercentage"], 63);
        assert_eq!(event.payload()["time"], "2024-03-01T12:30:00Z");
    }

    #[test]
    fn zero_height_page_is_zero_percent() {
        let measure = ScrollMeasure::new("https://example.com/post", 900, "abc");
        let event = measure.measure(
            ScrollSignal {
                scroll_top: 0,
                scroll_height: 0,
            },
            OffsetDateTime::UNIX_EPOCH,
        );

        assert_eq!(event.payload()["scrollTopPercentage"], 0);
        assert_eq!(event.payload()["scrollBottomPercentage"], 0);
    }
}
