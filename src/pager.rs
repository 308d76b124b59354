use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::{FetchError, SaleFeed};
use crate::credential::CredentialRefresher;
use crate::dedup::DedupStore;
use crate::retry::{self, RetryError, RetryPolicy};
use crate::types::{Cursor, Sale, SalesPage};

/// Default ceiling on pages read in one pass.
pub const DEFAULT_MAX_PAGES: u32 = 25;

/// A pass that could not complete. Nothing from a failed pass is delivered;
/// the next tick starts over from the newest page.
#[derive(Debug, Error)]
#[error("fetch failed at offset {offset} after {pages_fetched} page(s): {source}")]
pub struct PagerError {
    pub offset: u32,
    pub pages_fetched: u32,
    #[source]
    pub source: RetryError<FetchError>,
}

/// Unread stretch of the feed left behind by a pass that hit the page ceiling.
///
/// Sales newer than `floor` were unknown when the gap opened, so known sales
/// above it are skipped rather than ending the scan. Offsets only grow as new
/// sales land on top, so resuming at `offset` can re-read known sales but
/// never skips past unread ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backfill {
    pub offset: u32,
    pub floor: DateTime<Utc>,
}

impl Backfill {
    /// The more conservative of two resume points: lower offset, lower floor.
    pub fn lowest(a: Option<Backfill>, b: Option<Backfill>) -> Option<Backfill> {
        match (a, b) {
            (Some(a), Some(b)) => Some(Backfill {
                offset: a.offset.min(b.offset),
                floor: a.floor.min(b.floor),
            }),
            (a, b) => a.or(b),
        }
    }
}

/// New sales found by one pass, oldest first.
#[derive(Debug, Default)]
pub struct PassOutcome {
    pub sales: Vec<Sale>,
    pub pages_fetched: u32,
    /// Where the next pass has to resume, if the ceiling cut this one short.
    pub backfill: Option<Backfill>,
}

impl PassOutcome {
    pub fn truncated(&self) -> bool {
        self.backfill.is_some()
    }
}

/// Walks the feed from the newest page until it reaches already-known sales.
pub struct Pager<'a> {
    pub feed: &'a dyn SaleFeed,
    pub refresher: CredentialRefresher<'a>,
    pub policy: &'a RetryPolicy,
    pub max_pages: u32,
}

impl Pager<'_> {
    /// Collect every sale absent from `dedup`, sorted by sale time (ties by id).
    ///
    /// The head of the feed is read until a page reaches a known sale, the
    /// last page, or `max_pages`. Pages holding only sales already collected
    /// in this pass (offsets shifted under us) do not end the scan. An empty
    /// store only reads the first page. Whatever page budget is left then
    /// goes to a pending `backfill`.
    pub async fn collect_new_sales(
        &self,
        dedup: &DedupStore,
        backfill: Option<Backfill>,
    ) -> Result<PassOutcome, PagerError> {
        let fresh_start = dedup.is_empty();
        let mut outcome = PassOutcome::default();
        let mut in_pass: HashSet<String> = HashSet::new();

        let mut cursor = Cursor::start();
        loop {
            let page = self.fetch_counted(cursor, &mut outcome).await?;

            let mut fresh = 0usize;
            let mut reached_known = false;
            for sale in page.sales {
                if dedup.is_seen(&sale.id, sale.sold_at) {
                    reached_known = true;
                    continue;
                }
                if !in_pass.insert(sale.id.clone()) {
                    continue;
                }
                fresh += 1;
                outcome.sales.push(sale);
            }
            debug!(
                "Head page at offset {}: {fresh} new of {} entries",
                cursor.offset(),
                page.entries
            );

            if fresh_start || reached_known || !page.has_more || page.entries == 0 {
                break;
            }
            if outcome.pages_fetched >= self.max_pages {
                let floor = backfill.map(|b| b.floor).or(dedup.watermark());
                if let Some(floor) = floor {
                    warn!(
                        "Stopping after {} pages with new sales still coming; resuming at offset {} next tick",
                        outcome.pages_fetched,
                        page.next.offset()
                    );
                    outcome.backfill = Some(Backfill {
                        offset: page.next.offset(),
                        floor,
                    });
                }
                return Ok(Self::finish(outcome));
            }
            cursor = page.next;
        }

        if let Some(gap) = backfill.filter(|_| !fresh_start) {
            if outcome.pages_fetched >= self.max_pages {
                outcome.backfill = Some(gap);
            } else {
                self.fill_gap(gap, dedup, &mut in_pass, &mut outcome).await?;
            }
        }
        Ok(Self::finish(outcome))
    }

    /// Continue a pending backfill until it meets sales known before the gap
    /// opened, the end of the feed, or the page ceiling.
    async fn fill_gap(
        &self,
        gap: Backfill,
        dedup: &DedupStore,
        in_pass: &mut HashSet<String>,
        outcome: &mut PassOutcome,
    ) -> Result<(), PagerError> {
        let mut cursor = Cursor(gap.offset);
        loop {
            let page = self.fetch_counted(cursor, outcome).await?;

            let mut fresh = 0usize;
            let mut closed = false;
            for sale in page.sales {
                if dedup.is_seen(&sale.id, sale.sold_at) {
                    // Past the retention horizon the store cannot tell us more.
                    if sale.sold_at <= gap.floor || !dedup.contains(&sale.id) {
                        closed = true;
                    }
                    continue;
                }
                if in_pass.insert(sale.id.clone()) {
                    fresh += 1;
                    outcome.sales.push(sale);
                }
            }
            debug!(
                "Backfill page at offset {}: {fresh} new of {} entries",
                cursor.offset(),
                page.entries
            );

            if closed || !page.has_more || page.entries == 0 {
                info!("Backfill from offset {} complete", gap.offset);
                return Ok(());
            }
            if outcome.pages_fetched >= self.max_pages {
                outcome.backfill = Some(Backfill {
                    offset: page.next.offset(),
                    floor: gap.floor,
                });
                return Ok(());
            }
            cursor = page.next;
        }
    }

    fn finish(mut outcome: PassOutcome) -> PassOutcome {
        outcome
            .sales
            .sort_by(|a, b| a.sold_at.cmp(&b.sold_at).then_with(|| a.id.cmp(&b.id)));
        outcome
    }

    async fn fetch_counted(
        &self,
        cursor: Cursor,
        outcome: &mut PassOutcome,
    ) -> Result<SalesPage, PagerError> {
        let page = self.fetch(cursor).await.map_err(|source| PagerError {
            offset: cursor.offset(),
            pages_fetched: outcome.pages_fetched,
            source,
        })?;
        outcome.pages_fetched += 1;
        self.refresher.holder.mark_valid();
        Ok(page)
    }

    async fn fetch(&self, cursor: Cursor) -> Result<SalesPage, RetryError<FetchError>> {
        let feed = self.feed;
        let holder = self.refresher.holder;
        retry::execute(self.policy, "fetch_page", Some(&self.refresher), || async move {
            let credential = holder.get().map_err(|_| FetchError::NoCredential)?;
            feed.fetch_page(cursor, &credential).await
        })
        .await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::credential::{
        Credential, CredentialError, CredentialHolder, CredentialProvider, StaticProvider,
    };
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    pub(crate) fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_750_000_000 + secs, 0).unwrap()
    }

    pub(crate) fn sale(id: &str, secs: i64) -> Sale {
        Sale {
            id: id.to_string(),
            gift_name: "Lol Pop".into(),
            gift_id: format!("nft-{id}"),
            gift_number: 7,
            floor_price: Some(dec!(3)),
            sale_price: dec!(4.5),
            model: None,
            symbol: None,
            backdrop: None,
            sold_at: ts(secs),
        }
    }

    /// Scripted feed: pages newest first, optional queued failures.
    pub(crate) struct FakeFeed {
        pub pages: Mutex<Vec<Vec<Sale>>>,
        pub page_size: usize,
        pub failures: Mutex<VecDeque<FetchError>>,
        pub calls: AtomicU32,
        pub tokens_seen: Mutex<Vec<String>>,
    }

    impl FakeFeed {
        pub(crate) fn new(page_size: usize, pages: Vec<Vec<Sale>>) -> Self {
            Self {
                pages: Mutex::new(pages),
                page_size,
                failures: Mutex::new(VecDeque::new()),
                calls: AtomicU32::new(0),
                tokens_seen: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn fail_with(&self, errors: impl IntoIterator<Item = FetchError>) {
            self.failures.lock().unwrap().extend(errors);
        }

        pub(crate) fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SaleFeed for FakeFeed {
        async fn fetch_page(
            &self,
            cursor: Cursor,
            credential: &Credential,
        ) -> Result<SalesPage, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.tokens_seen
                .lock()
                .unwrap()
                .push(credential.token.clone());
            if let Some(err) = self.failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            let pages = self.pages.lock().unwrap();
            let index = cursor.offset() as usize / self.page_size;
            let sales = pages.get(index).cloned().unwrap_or_default();
            let entries = sales.len();
            Ok(SalesPage {
                sales,
                entries,
                has_more: index + 1 < pages.len(),
                next: cursor.advance(entries),
            })
        }
    }

    struct CountingProvider(AtomicU32);

    #[async_trait]
    impl CredentialProvider for CountingProvider {
        async fn acquire(&self) -> Result<String, CredentialError> {
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            Ok(format!("tma refreshed-{n}"))
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            jitter: false,
            ..RetryPolicy::default()
        }
    }

    fn holder() -> CredentialHolder {
        CredentialHolder::with_credential(Credential::new("tma initial", Utc::now()))
    }

    fn seeded(ids: &[(&str, i64)]) -> DedupStore {
        let mut store = DedupStore::new(1_000, Duration::days(1));
        for (id, secs) in ids {
            store.record(id, ts(*secs));
        }
        store
    }

    async fn run(
        feed: &FakeFeed,
        holder: &CredentialHolder,
        dedup: &DedupStore,
    ) -> Result<PassOutcome, PagerError> {
        let provider = StaticProvider::new("tma unused");
        let policy = policy();
        let pager = Pager {
            feed,
            refresher: CredentialRefresher {
                holder,
                provider: &provider,
            },
            policy: &policy,
            max_pages: DEFAULT_MAX_PAGES,
        };
        pager.collect_new_sales(dedup, None).await
    }

    fn ids(sales: &[Sale]) -> Vec<&str> {
        sales.iter().map(|s| s.id.as_str()).collect()
    }

    #[tokio::test]
    async fn sales_are_ordered_oldest_first() {
        let feed = FakeFeed::new(3, vec![vec![sale("c", 3), sale("a", 1), sale("b", 2)]]);
        let dedup = seeded(&[("old", 0)]);
        let outcome = run(&feed, &holder(), &dedup).await.unwrap();
        assert_eq!(ids(&outcome.sales), ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn ties_break_by_id() {
        let feed = FakeFeed::new(3, vec![vec![sale("z", 5), sale("m", 5), sale("b", 5)]]);
        let dedup = seeded(&[("old", 0)]);
        let outcome = run(&feed, &holder(), &dedup).await.unwrap();
        assert_eq!(ids(&outcome.sales), ["b", "m", "z"]);
    }

    #[tokio::test]
    async fn stops_before_duplicate_page() {
        let feed = FakeFeed::new(
            2,
            vec![
                vec![sale("n4", 40), sale("n3", 30)],
                vec![sale("n2", 20), sale("o2", 12)],
                vec![sale("o1", 11), sale("o0", 10)],
            ],
        );
        let dedup = seeded(&[("o0", 10), ("o1", 11), ("o2", 12)]);
        let outcome = run(&feed, &holder(), &dedup).await.unwrap();
        assert_eq!(feed.calls(), 2);
        assert_eq!(outcome.pages_fetched, 2);
        assert_eq!(ids(&outcome.sales), ["n2", "n3", "n4"]);
    }

    #[tokio::test]
    async fn first_page_of_known_sales_ends_pass() {
        let feed = FakeFeed::new(
            2,
            vec![
                vec![sale("n4", 40), sale("n3", 30)],
                vec![sale("n2", 20), sale("n1", 15)],
                vec![sale("o1", 11), sale("o0", 10)],
                vec![sale("never", 5), sale("reached", 4)],
            ],
        );
        let dedup = seeded(&[("o0", 10), ("o1", 11)]);
        let outcome = run(&feed, &holder(), &dedup).await.unwrap();
        assert_eq!(feed.calls(), 3);
        assert_eq!(ids(&outcome.sales), ["n1", "n2", "n3", "n4"]);
    }

    #[tokio::test]
    async fn duplicate_first_page_returns_nothing() {
        let feed = FakeFeed::new(2, vec![vec![sale("a", 1), sale("b", 2)], vec![sale("c", 0)]]);
        let dedup = seeded(&[("a", 1), ("b", 2)]);
        let outcome = run(&feed, &holder(), &dedup).await.unwrap();
        assert!(outcome.sales.is_empty());
        assert_eq!(feed.calls(), 1);
    }

    #[tokio::test]
    async fn empty_first_page_returns_nothing() {
        let feed = FakeFeed::new(2, vec![vec![]]);
        let outcome = run(&feed, &holder(), &seeded(&[("x", 0)])).await.unwrap();
        assert!(outcome.sales.is_empty());
        assert_eq!(outcome.pages_fetched, 1);
    }

    #[tokio::test]
    async fn same_page_twice_yields_sale_once() {
        let feed = FakeFeed::new(2, vec![vec![sale("s1", 5), sale("old", 0)]]);
        let mut dedup = seeded(&[("old", 0)]);

        let first = run(&feed, &holder(), &dedup).await.unwrap();
        assert_eq!(ids(&first.sales), ["s1"]);
        for s in &first.sales {
            dedup.record(&s.id, s.sold_at);
        }

        let second = run(&feed, &holder(), &dedup).await.unwrap();
        assert!(second.sales.is_empty());
    }

    #[tokio::test]
    async fn shifted_offsets_do_not_duplicate_within_pass() {
        // "n2" shows up at the end of page 1 and again at the head of page 2.
        let feed = FakeFeed::new(
            2,
            vec![
                vec![sale("n3", 30), sale("n2", 20)],
                vec![sale("n2", 20), sale("n1", 10)],
                vec![sale("o0", 1)],
            ],
        );
        let dedup = seeded(&[("o0", 1)]);
        let outcome = run(&feed, &holder(), &dedup).await.unwrap();
        assert_eq!(ids(&outcome.sales), ["n1", "n2", "n3"]);
    }

    #[tokio::test]
    async fn page_of_in_pass_repeats_keeps_paging() {
        // A burst pushed page 1 down by a full page between the two fetches.
        let feed = FakeFeed::new(
            2,
            vec![
                vec![sale("n3", 30), sale("n2", 20)],
                vec![sale("n3", 30), sale("n2", 20)],
                vec![sale("n1", 10), sale("o0", 1)],
            ],
        );
        let mut dedup = seeded(&[("o0", 1)]);
        let first = run(&feed, &holder(), &dedup).await.unwrap();
        assert_eq!(feed.calls(), 3);
        assert_eq!(ids(&first.sales), ["n1", "n2", "n3"]);
        for s in &first.sales {
            dedup.record(&s.id, s.sold_at);
        }

        *feed.pages.lock().unwrap() = vec![
            vec![sale("n5", 50), sale("n4", 40)],
            vec![sale("n3", 30), sale("n2", 20)],
            vec![sale("n1", 10), sale("o0", 1)],
        ];
        let second = run(&feed, &holder(), &dedup).await.unwrap();
        assert_eq!(ids(&second.sales), ["n4", "n5"]);
    }

    async fn pass_with_ceiling(
        feed: &FakeFeed,
        dedup: &DedupStore,
        backfill: Option<Backfill>,
        max_pages: u32,
    ) -> PassOutcome {
        let provider = StaticProvider::new("tma unused");
        let policy = policy();
        let holder = holder();
        let pager = Pager {
            feed,
            refresher: CredentialRefresher {
                holder: &holder,
                provider: &provider,
            },
            policy: &policy,
            max_pages,
        };
        pager.collect_new_sales(dedup, backfill).await.unwrap()
    }

    #[tokio::test]
    async fn sales_beyond_ceiling_arrive_on_later_passes() {
        let mut pages: Vec<Vec<Sale>> = (0..5)
            .map(|p| vec![sale(&format!("p{p}"), 1_000 - p)])
            .collect();
        pages.push(vec![sale("old", 0)]);
        let feed = FakeFeed::new(1, pages);
        let mut dedup = seeded(&[("old", 0)]);

        let mut delivered: Vec<String> = Vec::new();
        let mut backfill = None;
        for pass in 0..10 {
            let outcome = pass_with_ceiling(&feed, &dedup, backfill, 2).await;
            assert!(outcome.pages_fetched <= 2);
            for s in &outcome.sales {
                assert!(dedup.record(&s.id, s.sold_at));
                delivered.push(s.id.clone());
            }
            backfill = outcome.backfill;
            if pass == 0 {
                assert_eq!(ids(&outcome.sales), ["p1", "p0"]);
                assert_eq!(backfill.map(|b| b.offset), Some(2));
            }
            if pass == 1 {
                // A new sale lands on top while the gap is still open.
                feed.pages.lock().unwrap().insert(0, vec![sale("late", 2_000)]);
            }
            if backfill.is_none() {
                break;
            }
        }

        assert!(backfill.is_none());
        delivered.sort();
        assert_eq!(delivered, ["late", "p0", "p1", "p2", "p3", "p4"]);
    }

    #[tokio::test]
    async fn backfill_stops_at_sales_known_before_the_gap() {
        let feed = FakeFeed::new(
            1,
            vec![
                vec![sale("n2", 20)],
                vec![sale("n1", 15)],
                vec![sale("o1", 11)],
                vec![sale("never", 5)],
            ],
        );
        let dedup = seeded(&[("o1", 11), ("n2", 20)]);
        let gap = Backfill {
            offset: 1,
            floor: ts(11),
        };
        let outcome = pass_with_ceiling(&feed, &dedup, Some(gap), 10).await;
        assert_eq!(ids(&outcome.sales), ["n1"]);
        assert!(outcome.backfill.is_none());
        assert_eq!(feed.calls(), 3);
    }

    #[tokio::test]
    async fn fresh_store_ignores_stale_backfill() {
        let feed = FakeFeed::new(1, vec![vec![sale("a", 1)], vec![sale("b", 0)]]);
        let gap = Backfill {
            offset: 1,
            floor: ts(0),
        };
        let outcome = pass_with_ceiling(&feed, &DedupStore::default(), Some(gap), 10).await;
        assert_eq!(ids(&outcome.sales), ["a"]);
        assert!(outcome.backfill.is_none());
        assert_eq!(feed.calls(), 1);
    }

    #[tokio::test]
    async fn fresh_store_reads_first_page_only() {
        let feed = FakeFeed::new(
            2,
            vec![vec![sale("b", 2), sale("a", 1)], vec![sale("z", 0)]],
        );
        let outcome = run(&feed, &holder(), &DedupStore::default()).await.unwrap();
        assert_eq!(feed.calls(), 1);
        assert_eq!(ids(&outcome.sales), ["a", "b"]);
    }

    #[tokio::test]
    async fn page_ceiling_truncates() {
        let pages: Vec<Vec<Sale>> = (0..10)
            .map(|p| vec![sale(&format!("p{p}"), 1_000 - p)])
            .collect();
        let feed = FakeFeed::new(1, pages);
        let dedup = seeded(&[("old", 0)]);
        let provider = StaticProvider::new("tma unused");
        let policy = policy();
        let holder = holder();
        let pager = Pager {
            feed: &feed,
            refresher: CredentialRefresher {
                holder: &holder,
                provider: &provider,
            },
            policy: &policy,
            max_pages: 3,
        };
        let outcome = pager.collect_new_sales(&dedup, None).await.unwrap();
        assert!(outcome.truncated());
        assert_eq!(outcome.pages_fetched, 3);
        assert_eq!(ids(&outcome.sales), ["p2", "p1", "p0"]);
    }

    #[tokio::test]
    async fn auth_expired_refreshes_once_and_refetches() {
        let feed = FakeFeed::new(2, vec![vec![sale("s1", 5)]]);
        feed.fail_with([FetchError::AuthExpired { status: 401 }]);
        let holder = holder();
        let provider = CountingProvider(AtomicU32::new(0));
        let policy = policy();
        let pager = Pager {
            feed: &feed,
            refresher: CredentialRefresher {
                holder: &holder,
                provider: &provider,
            },
            policy: &policy,
            max_pages: DEFAULT_MAX_PAGES,
        };
        let outcome = pager.collect_new_sales(&seeded(&[("old", 0)]), None).await.unwrap();
        assert_eq!(ids(&outcome.sales), ["s1"]);
        assert_eq!(provider.0.load(Ordering::SeqCst), 1);
        assert_eq!(feed.calls(), 2);
        assert_eq!(
            *feed.tokens_seen.lock().unwrap(),
            ["tma initial", "tma refreshed-0"]
        );
        assert_eq!(
            holder.get().unwrap().status,
            crate::credential::CredentialStatus::Valid
        );
    }

    #[tokio::test]
    async fn second_auth_expired_fails_pass() {
        let feed = FakeFeed::new(2, vec![vec![sale("s1", 5)]]);
        feed.fail_with([
            FetchError::AuthExpired { status: 401 },
            FetchError::AuthExpired { status: 401 },
        ]);
        let holder = holder();
        let provider = CountingProvider(AtomicU32::new(0));
        let policy = policy();
        let pager = Pager {
            feed: &feed,
            refresher: CredentialRefresher {
                holder: &holder,
                provider: &provider,
            },
            policy: &policy,
            max_pages: DEFAULT_MAX_PAGES,
        };
        let err = pager
            .collect_new_sales(&seeded(&[("old", 0)]), None)
            .await
            .unwrap_err();
        assert!(matches!(err.source, RetryError::AuthRejected(_)));
        assert_eq!(provider.0.load(Ordering::SeqCst), 1);
        assert_eq!(feed.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn network_errors_exhaust_and_fail_pass() {
        let feed = FakeFeed::new(2, vec![vec![sale("s1", 5)]]);
        feed.fail_with((0..5).map(|_| FetchError::NetworkError("reset".into())));
        let err = run(&feed, &holder(), &seeded(&[("old", 0)]))
            .await
            .unwrap_err();
        assert_eq!(feed.calls(), 5);
        assert_eq!(err.pages_fetched, 0);
        assert!(matches!(err.source, RetryError::Exhausted { attempts: 5, .. }));
    }

    #[tokio::test]
    async fn missing_credential_is_acquired() {
        let feed = FakeFeed::new(2, vec![vec![sale("s1", 5)]]);
        let holder = CredentialHolder::new();
        let provider = CountingProvider(AtomicU32::new(0));
        let policy = policy();
        let pager = Pager {
            feed: &feed,
            refresher: CredentialRefresher {
                holder: &holder,
                provider: &provider,
            },
            policy: &policy,
            max_pages: DEFAULT_MAX_PAGES,
        };
        let outcome = pager.collect_new_sales(&seeded(&[("old", 0)]), None).await.unwrap();
        assert_eq!(outcome.sales.len(), 1);
        assert_eq!(feed.calls(), 1);
        assert_eq!(provider.0.load(Ordering::SeqCst), 1);
    }
}
