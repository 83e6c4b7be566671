//! Aggregation routine computing [`AggregationSummary`] from raw rows.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

use crate::model::{
    AggregationSummary, DeviceStat, DeviceType, EventRow, EventType, PageStat, SessionRow,
    SourceStat,
};

/// Number of entries kept in `top_pages`.
pub const TOP_PAGES: usize = 10;

/// Source label for sessions without a referrer.
pub const DIRECT_SOURCE: &str = "Direct";

/// Summarize rows created at or after `since`.
pub fn summarize(
    sessions: &[SessionRow],
    events: &[EventRow],
    since: DateTime<Utc>,
) -> AggregationSummary {
    let page_views: Vec<&EventRow> = events
        .iter()
        .filter(|e| e.event_type == EventType::PageView && e.created_at >= since)
        .collect();
    let sessions: Vec<&SessionRow> = sessions.iter().filter(|s| s.started_at >= since).collect();

    let unique_visitors = page_views
        .iter()
        .map(|e| e.session_id.as_str())
        .collect::<HashSet<_>>()
        .len() as u64;

    let finalized: Vec<&&SessionRow> = sessions.iter().filter(|s| s.is_finalized()).collect();
    let (avg_session_duration, bounce_rate) = if finalized.is_empty() {
        (0.0, 0.0)
    } else {
        let total: i64 = finalized.iter().filter_map(|s| s.duration_seconds).sum();
        let bounced = finalized.iter().filter(|s| s.is_bounce == Some(true)).count();
        (
            total as f64 / finalized.len() as f64,
            bounced as f64 * 100.0 / finalized.len() as f64,
        )
    };

    AggregationSummary {
        total_page_views: page_views.len() as u64,
        unique_visitors,
        total_sessions: sessions.len() as u64,
        avg_session_duration,
        bounce_rate,
        top_pages: top_pages(&page_views),
        traffic_sources: traffic_sources(&sessions),
        device_breakdown: device_breakdown(&sessions),
    }
}

fn top_pages(page_views: &[&EventRow]) -> Vec<PageStat> {
    let mut counts: HashMap<&str, u64> = HashMap::new();
    for event in page_views {
        *counts.entry(event.page_url.as_str()).or_default() += 1;
    }
    let mut pages: Vec<PageStat> = counts
        .into_iter()
        .map(|(page_url, views)| PageStat { page_url: page_url.to_string(), views })
        .collect();
    pages.sort_by(|a, b| b.views.cmp(&a.views).then_with(|| a.page_url.cmp(&b.page_url)));
    pages.truncate(TOP_PAGES);
    pages
}

fn traffic_sources(sessions: &[&SessionRow]) -> Vec<SourceStat> {
    let mut counts: HashMap<String, u64> = HashMap::new();
    for session in sessions {
        let source = session
            .referrer
            .as_deref()
            .and_then(referrer_host)
            .unwrap_or(DIRECT_SOURCE)
            .to_string();
        *counts.entry(source).or_default() += 1;
    }
    let mut sources: Vec<SourceStat> = counts
        .into_iter()
        .map(|(source, sessions)| SourceStat { source, sessions })
        .collect();
    sources.sort_by(|a, b| b.sessions.cmp(&a.sessions).then_with(|| a.source.cmp(&b.source)));
    sources
}

fn device_breakdown(sessions: &[&SessionRow]) -> Vec<DeviceStat> {
    if sessions.is_empty() {
        return Vec::new();
    }
    let mut counts: HashMap<DeviceType, u64> = HashMap::new();
    for session in sessions {
        *counts.entry(session.device_type).or_default() += 1;
    }
    let total = sessions.len() as f64;
    let mut devices: Vec<DeviceStat> = counts
        .into_iter()
        .map(|(device_type, sessions)| DeviceStat {
            device_type,
            sessions,
            percentage: sessions as f64 * 100.0 / total,
        })
        .collect();
    devices.sort_by(|a, b| {
        b.sessions
            .cmp(&a.sessions)
            .then_with(|| a.device_type.as_str().cmp(b.device_type.as_str()))
    });
    devices
}

/// Host part of a referrer URL, without a `www.` prefix.
pub fn referrer_host(referrer: &str) -> Option<&str> {
    let rest = referrer
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(referrer);
    let host = rest.split(['/', '?', '#']).next()?;
    let host = host.rsplit('@').next()?.split(':').next()?;
    let host = host.strip_prefix("www.").unwrap_or(host);
    (!host.is_empty()).then_some(host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;
    use serde_json::Map;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
    }

    fn session(id: &str, device: DeviceType, referrer: Option<&str>, closed: Option<(i64, bool)>) -> SessionRow {
        SessionRow {
            session_id: id.to_string(),
            started_at: base() + Duration::hours(1),
            ended_at: closed.map(|_| base() + Duration::hours(2)),
            duration_seconds: closed.map(|(d, _)| d),
            entry_page: "/".to_string(),
            exit_page: None,
            page_count: 1,
            referrer: referrer.map(str::to_string),
            device_type: device,
            browser: "Chrome".to_string(),
            os: "Windows".to_string(),
            country: None,
            city: None,
            is_bounce: closed.map(|(_, b)| b),
        }
    }

    fn page_view(session_id: &str, page: &str) -> EventRow {
        EventRow {
            id: format!("{}-{}", session_id, page),
            event_type: EventType::PageView,
            event_name: "Page View".to_string(),
            page_url: page.to_string(),
            referrer: None,
            session_id: session_id.to_string(),
            user_agent: "ua".to_string(),
            country: None,
            city: None,
            device_type: DeviceType::Desktop,
            browser: "Chrome".to_string(),
            os: "Windows".to_string(),
            properties: Map::new(),
            created_at: base() + Duration::hours(1),
        }
    }

    #[test]
    fn test_summarize_empty() {
        let summary = summarize(&[], &[], base());
        assert_eq!(summary, AggregationSummary::default());
    }

    #[test]
    fn test_summarize_counts() {
        let sessions = vec![
            session("a", DeviceType::Desktop, None, Some((30, false))),
            session("b", DeviceType::Mobile, Some("https://www.google.com/search?q=x"), Some((10, true))),
            session("c", DeviceType::Mobile, Some("https://google.com/"), None),
        ];
        let mut click = page_view("a", "/home");
        click.event_type = EventType::Click;
        let events = vec![
            page_view("a", "/home"),
            page_view("a", "/services"),
            page_view("b", "/home"),
            click,
        ];

        let summary = summarize(&sessions, &events, base());

        assert_eq!(summary.total_page_views, 3);
        assert_eq!(summary.unique_visitors, 2);
        assert_eq!(summary.total_sessions, 3);
        assert_eq!(summary.avg_session_duration, 20.0);
        assert_eq!(summary.bounce_rate, 50.0);
        assert_eq!(summary.top_pages[0], PageStat { page_url: "/home".to_string(), views: 2 });
        assert_eq!(summary.traffic_sources[0], SourceStat { source: "google.com".to_string(), sessions: 2 });
        assert_eq!(summary.traffic_sources[1].source, DIRECT_SOURCE);
        assert_eq!(summary.device_breakdown[0].device_type, DeviceType::Mobile);
        assert!((summary.device_breakdown[0].percentage - 66.666).abs() < 0.01);
    }

    const DEVICES: [DeviceType; 3] = [DeviceType::Desktop, DeviceType::Mobile, DeviceType::Tablet];
    const REFERRERS: [&str; 2] = ["https://www.google.com/", "https://news.ycombinator.com/item"];

    fn arb_events() -> impl Strategy<Value = Vec<EventRow>> {
        proptest::collection::vec((0u8..6, any::<bool>(), 0u8..4), 0..60).prop_map(|rows| {
            rows.into_iter()
                .enumerate()
                .map(|(n, (visitor, is_page_view, page))| {
                    let mut event = page_view(&format!("s{}", visitor), &format!("/p{}", page));
                    event.id = format!("e{}", n);
                    if !is_page_view {
                        event.event_type = EventType::Click;
                    }
                    event
                })
                .collect()
        })
    }

    fn arb_sessions() -> impl Strategy<Value = Vec<SessionRow>> {
        proptest::collection::vec(
            (0usize..3, proptest::option::of(0usize..2), proptest::option::of((0i64..3600, any::<bool>()))),
            0..30,
        )
        .prop_map(|rows| {
            rows.into_iter()
                .enumerate()
                .map(|(n, (device, referrer, closed))| {
                    session(&format!("s{}", n), DEVICES[device], referrer.map(|r| REFERRERS[r]), closed)
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_totals_match_row_counts(events in arb_events(), sessions in arb_sessions()) {
            let summary = summarize(&sessions, &events, base());

            let page_views: Vec<&EventRow> = events.iter().filter(|e| e.event_type == EventType::PageView).collect();
            let visitors: HashSet<&str> = page_views.iter().map(|e| e.session_id.as_str()).collect();
            prop_assert_eq!(summary.total_page_views, page_views.len() as u64);
            prop_assert_eq!(summary.unique_visitors, visitors.len() as u64);
            prop_assert!(summary.unique_visitors <= summary.total_page_views);
            prop_assert_eq!(summary.total_sessions, sessions.len() as u64);

            let by_source: u64 = summary.traffic_sources.iter().map(|s| s.sessions).sum();
            let by_device: u64 = summary.device_breakdown.iter().map(|d| d.sessions).sum();
            prop_assert_eq!(by_source, summary.total_sessions);
            prop_assert_eq!(by_device, summary.total_sessions);
            if !sessions.is_empty() {
                let percent: f64 = summary.device_breakdown.iter().map(|d| d.percentage).sum();
                prop_assert!((percent - 100.0).abs() < 1e-6);
            }
            prop_assert!((0.0..=100.0).contains(&summary.bounce_rate));
        }
    }

    #[test]
    fn test_summarize_respects_since() {
        let events = vec![page_view("a", "/home")];
        let summary = summarize(&[], &events, base() + Duration::days(1));
        assert_eq!(summary.total_page_views, 0);
    }

    #[test]
    fn test_top_pages_truncated() {
        let events: Vec<EventRow> = (0..15).map(|i| page_view("a", &format!("/p{}", i))).collect();
        let summary = summarize(&[], &events, base());
        assert_eq!(summary.top_pages.len(), TOP_PAGES);
    }

    #[test]
    fn test_referrer_host() {
        assert_eq!(referrer_host("https://www.example.com/a/b"), Some("example.com"));
        assert_eq!(referrer_host("http://news.ycombinator.com:443?x"), Some("news.ycombinator.com"));
        assert_eq!(referrer_host("example.org/path"), Some("example.org"));
        assert_eq!(referrer_host(""), None);
    }
}
