use std::{future::Future, sync::Arc, time::Duration};

use rand::Rng;
use tokio::sync::{mpsc, watch};

use crate::skein::{config::Config, connection::Connection};

/// Endpoint selection order across reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Walk the configured list in order, wrapping around.
    Sequential,
    /// Any endpoint, uniformly at random.
    Random,
    /// Walk schemes in first-appearance order, random endpoint within the
    /// current scheme.
    RandomWithinScheme,
}

impl Strategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sequential" => Some(Strategy::Sequential),
            "random" => Some(Strategy::Random),
            "random-within-scheme" => Some(Strategy::RandomWithinScheme),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("reconnect: gave up after {0} consecutive failures")]
pub struct Exhausted(pub usize);

/// The live endpoint list. Starts from config and grows at runtime;
/// a requested switch preempts the strategy for exactly one dial.
#[derive(Default)]
pub struct EndpointTable {
    list: std::sync::RwLock<Vec<String>>,
    switch_to: std::sync::Mutex<Option<String>>,
}

impl EndpointTable {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            list: std::sync::RwLock::new(endpoints),
            switch_to: std::sync::Mutex::new(None),
        }
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.list.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Append a new endpoint; duplicates are ignored.
    pub fn add(&self, uri: &str) -> bool {
        let mut list = self.list.write().unwrap_or_else(|e| e.into_inner());
        if list.iter().any(|e| e == uri) {
            return false;
        }
        list.push(uri.to_string());
        true
    }

    /// Queue a one-shot override for the next dial, adding the endpoint if
    /// it is new.
    pub fn request_switch(&self, uri: &str) {
        self.add(uri);
        *self.switch_to.lock().unwrap_or_else(|e| e.into_inner()) = Some(uri.to_string());
    }

    pub fn take_switch(&self) -> Option<String> {
        self.switch_to
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

/// Pick the `n`th endpoint under a strategy.
pub fn pick(endpoints: &[String], strategy: Strategy, n: u64) -> String {
    match strategy {
        Strategy::Sequential => endpoints[(n % endpoints.len() as u64) as usize].clone(),
        Strategy::Random => {
            let i = rand::thread_rng().gen_range(0..endpoints.len());
            endpoints[i].clone()
        }
        Strategy::RandomWithinScheme => {
            let mut schemes: Vec<&str> = Vec::new();
            for e in endpoints {
                if let Some((s, _)) = e.split_once("://") {
                    if !schemes.contains(&s) {
                        schemes.push(s);
                    }
                }
            }
            let scheme = schemes[(n % schemes.len() as u64) as usize];
            let prefix = format!("{scheme}://");
            let group: Vec<&String> = endpoints.iter().filter(|e| e.starts_with(&prefix)).collect();
            let i = rand::thread_rng().gen_range(0..group.len());
            group[i].clone()
        }
    }
}

/// Dial endpoints forever, handing each live connection to the consumer and
/// waiting out its lifetime before dialing again. Returns [`Exhausted`]
/// after `max_errors` consecutive dial failures; returns Ok on abort or
/// when the consumer goes away.
pub async fn run<D, F>(
    cfg: &Config,
    table: Arc<EndpointTable>,
    dial: D,
    conn_tx: mpsc::Sender<Arc<Connection>>,
    mut abort: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    D: Fn(String) -> F,
    F: Future<Output = anyhow::Result<Arc<Connection>>>,
{
    let strategy = Strategy::parse(&cfg.strategy)
        .ok_or_else(|| anyhow::anyhow!("reconnect: unknown strategy {:?}", cfg.strategy))?;
    let mut failures = 0usize;
    let mut attempt = 0u64;

    loop {
        if *abort.borrow() {
            return Ok(());
        }

        let uri = match table.take_switch() {
            Some(uri) => {
                tracing::info!(uri = %uri, "reconnect: switching endpoint on request");
                uri
            }
            None => {
                let endpoints = table.snapshot();
                if endpoints.is_empty() {
                    anyhow::bail!("reconnect: endpoint table is empty");
                }
                let uri = pick(&endpoints, strategy, attempt);
                attempt += 1;
                uri
            }
        };
        tracing::debug!(uri = %uri, attempt, "reconnect: dialing");

        match dial(uri.clone()).await {
            Ok(conn) => {
                failures = 0;
                tracing::info!(uri = %uri, "reconnect: connection established");
                let mut closed = conn.closed();
                if conn_tx.send(conn.clone()).await.is_err() {
                    conn.cleanup();
                    return Ok(());
                }
                tokio::select! {
                    _ = closed.changed() => {
                        tracing::info!(uri = %uri, "reconnect: connection lost");
                    }
                    _ = abort.changed() => {
                        conn.cleanup();
                        return Ok(());
                    }
                }
            }
            Err(err) => {
                failures += 1;
                tracing::warn!(uri = %uri, err = %err, failures, "reconnect: dial failed");
                if failures >= cfg.max_errors {
                    return Err(Exhausted(failures).into());
                }
            }
        }

        let delay = jittered(cfg.reconnect_interval);
        tracing::debug!(delay = %humantime::format_duration(delay), "reconnect: backing off");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = abort.changed() => return Ok(()),
        }
    }
}

/// Uniform jitter in [interval/2, interval*3/2) so a fleet of nodes does
/// not reconnect in lockstep.
fn jittered(interval: Duration) -> Duration {
    if interval.is_zero() {
        return interval;
    }
    let base = interval.as_millis() as u64;
    let lo = base / 2;
    Duration::from_millis(rand::thread_rng().gen_range(lo..lo + base))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn endpoints() -> Vec<String> {
        vec![
            "mtls://a:8443".into(),
            "mtls://b:8443".into(),
            "http://c:80".into(),
            "dns://d".into(),
        ]
    }

    #[test]
    fn sequential_wraps_in_order() {
        let eps = endpoints();
        let got: Vec<String> = (0..5).map(|n| pick(&eps, Strategy::Sequential, n)).collect();
        assert_eq!(got[0], "mtls://a:8443");
        assert_eq!(got[1], "mtls://b:8443");
        assert_eq!(got[2], "http://c:80");
        assert_eq!(got[3], "dns://d");
        assert_eq!(got[4], "mtls://a:8443");
    }

    #[test]
    fn random_within_scheme_cycles_schemes() {
        let eps = endpoints();
        for round in 0..3u64 {
            let n = round * 3;
            assert!(pick(&eps, Strategy::RandomWithinScheme, n).starts_with("mtls://"));
            assert_eq!(pick(&eps, Strategy::RandomWithinScheme, n + 1), "http://c:80");
            assert_eq!(pick(&eps, Strategy::RandomWithinScheme, n + 2), "dns://d");
        }
    }

    #[test]
    fn random_stays_in_the_list() {
        let eps = endpoints();
        for n in 0..32 {
            assert!(eps.contains(&pick(&eps, Strategy::Random, n)));
        }
    }

    #[test]
    fn table_dedups_and_switches_once() {
        let table = EndpointTable::new(endpoints());
        assert!(!table.add("mtls://a:8443"));
        assert!(table.add("wg://100.64.0.1:4444"));
        assert_eq!(table.snapshot().len(), 5);

        table.request_switch("dns://d");
        assert_eq!(table.take_switch().as_deref(), Some("dns://d"));
        assert_eq!(table.take_switch(), None);

        // Switching to something new also registers it.
        table.request_switch("http://new:80");
        assert!(table.snapshot().contains(&"http://new:80".to_string()));
    }

    #[test]
    fn jitter_stays_in_band() {
        let iv = Duration::from_millis(1000);
        for _ in 0..64 {
            let j = jittered(iv);
            assert!(j >= Duration::from_millis(500) && j < Duration::from_millis(1500));
        }
        assert_eq!(jittered(Duration::ZERO), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_max_consecutive_failures() {
        let mut cfg = Config::test_default();
        cfg.max_errors = 4;
        let table = Arc::new(EndpointTable::new(vec!["http://dead:80".into()]));

        let attempts = Arc::new(AtomicUsize::new(0));
        let a2 = attempts.clone();
        let (tx, _rx) = mpsc::channel(1);
        let (_abort_tx, abort_rx) = watch::channel(false);

        let err = run(
            &cfg,
            table,
            move |_uri| {
                let a = a2.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("refused")
                }
            },
            tx,
            abort_rx,
        )
        .await
        .unwrap_err();

        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert!(err.downcast_ref::<Exhausted>().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_failure_budget() {
        let mut cfg = Config::test_default();
        cfg.max_errors = 3;
        let table = Arc::new(EndpointTable::new(vec!["http://flaky:80".into()]));

        let attempts = Arc::new(AtomicUsize::new(0));
        let a2 = attempts.clone();
        let (tx, mut rx) = mpsc::channel(1);
        let (abort_tx, abort_rx) = watch::channel(false);

        // Consumer: take connections and drop them dead immediately.
        let consumer = tokio::spawn(async move {
            let mut seen = 0;
            while let Some(conn) = rx.recv().await {
                let conn: Arc<Connection> = conn;
                conn.cleanup();
                seen += 1;
                if seen == 2 {
                    break;
                }
            }
            seen
        });

        // Fail twice, succeed, fail twice, succeed: never three in a row.
        let driver = tokio::spawn(async move {
            run(
                &cfg,
                table,
                move |uri| {
                    let n = a2.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n % 3 == 2 {
                            let (conn, _io) = Connection::new(&uri);
                            Ok(conn)
                        } else {
                            anyhow::bail!("refused")
                        }
                    }
                },
                tx,
                abort_rx,
            )
            .await
        });

        assert_eq!(consumer.await.unwrap(), 2);
        abort_tx.send(true).unwrap();
        driver.await.unwrap().unwrap();
        assert!(attempts.load(Ordering::SeqCst) >= 6);
    }

    #[tokio::test(start_paused = true)]
    async fn switch_request_preempts_the_strategy() {
        let mut cfg = Config::test_default();
        cfg.max_errors = 1000;
        let table = Arc::new(EndpointTable::new(vec!["http://main:80".into()]));
        table.request_switch("dns://fallback");

        let dialed = Arc::new(std::sync::Mutex::new(Vec::new()));
        let d2 = dialed.clone();
        let (tx, _rx) = mpsc::channel(1);
        let (abort_tx, abort_rx) = watch::channel(false);

        let driver = tokio::spawn(async move {
            run(
                &cfg,
                table,
                move |uri| {
                    let d = d2.clone();
                    async move {
                        d.lock().unwrap().push(uri);
                        anyhow::bail!("refused")
                    }
                },
                tx,
                abort_rx,
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        abort_tx.send(true).unwrap();
        driver.await.unwrap().unwrap();

        let dialed = dialed.lock().unwrap();
        assert_eq!(dialed[0], "dns://fallback");
        assert!(dialed[1..].iter().all(|u| u == "http://main:80" || u == "dns://fallback"));
    }

    #[tokio::test(start_paused = true)]
    async fn abort_stops_the_loop() {
        let mut cfg = Config::test_default();
        cfg.max_errors = 1000;
        let table = Arc::new(EndpointTable::new(vec!["http://dead:80".into()]));

        let (tx, _rx) = mpsc::channel(1);
        let (abort_tx, abort_rx) = watch::channel(false);

        let driver = tokio::spawn(async move {
            run(&cfg, table, |_uri| async { anyhow::bail!("refused") }, tx, abort_rx).await
        });

        tokio::task::yield_now().await;
        abort_tx.send(true).unwrap();
        driver.await.unwrap().unwrap();
    }
}
