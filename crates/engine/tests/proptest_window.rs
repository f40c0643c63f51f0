use common::Candle;
use engine::{AppendOutcome, RollingWindowStore};
use proptest::prelude::*;

fn candle(open_time: i64) -> Candle {
    Candle {
        symbol: "BTCUSDT".to_string(),
        open_time,
        open: 100.0,
        high: 101.0,
        low: 99.0,
        close: 100.5,
        volume: 10.0,
        turnover: 1005.0,
    }
}

proptest! {
    /// The window never grows past its capacity.
    #[test]
    fn window_never_exceeds_capacity(
        capacity in 1usize..50,
        times in prop::collection::vec(-1_000i64..1_000, 0..200),
    ) {
        let mut store = RollingWindowStore::new(capacity);
        for t in times {
            store.append(candle(t));
            prop_assert!(store.len("BTCUSDT") <= capacity);
        }
    }

    /// Appending at or before the newest open_time changes nothing.
    #[test]
    fn stale_append_is_a_no_op(
        times in prop::collection::vec(0i64..10_000, 1..100),
        back in 0i64..500,
    ) {
        let mut store = RollingWindowStore::new(64);
        for t in &times {
            store.append(candle(*t));
        }
        let before = store.snapshot("BTCUSDT");
        let newest = before.last().map(|c| c.open_time).unwrap_or_default();

        prop_assert_eq!(store.append(candle(newest - back)), AppendOutcome::Rejected);
        prop_assert_eq!(store.snapshot("BTCUSDT"), before);
    }

    /// Stored open_times are strictly increasing.
    #[test]
    fn stored_candles_are_strictly_ordered(
        times in prop::collection::vec(-1_000i64..1_000, 0..200),
    ) {
        let mut store = RollingWindowStore::new(32);
        for t in times {
            store.append(candle(t));
        }
        let stored = store.snapshot("BTCUSDT");
        for pair in stored.windows(2) {
            prop_assert!(pair[0].open_time < pair[1].open_time);
        }
    }
}
