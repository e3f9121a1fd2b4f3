//! # Upstox Feed Model
//!
//! The structured messages the relay caches and fans out. They mirror the V3
//! `FeedResponse` schema in JSON form: camelCase keys, enum names as strings
//! and every oneof rendered as a single keyed object, e.g.
//!
//! ```json
//! {"type":"live_feed","feeds":{"NSE_INDEX|Nifty 50":{"fullFeed":{"indexFF":{"ltpc":{"ltp":22450.5,"ltt":1718000000000,"ltq":0,"cp":22300.0}}},"requestMode":"full_d5"}},"currentTs":1718000000123}
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::decoder::FeedSnapshot;

/// Frame type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedType {
    /// First snapshot after subscribing.
    InitialFeed,
    /// Incremental tick.
    LiveFeed,
    /// Segment status update.
    MarketInfo,
}

/// Detail level of a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestMode {
    /// Last traded price only.
    #[default]
    Ltpc,
    /// Full feed with 5 depth levels.
    FullD5,
    /// Option greeks.
    OptionGreeks,
    /// Full feed with 30 depth levels.
    FullD30,
}

/// Segment status reported in market info frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketStatus {
    /// Pre-open session started.
    PreOpenStart,
    /// Pre-open session ended.
    PreOpenEnd,
    /// Regular trading.
    NormalOpen,
    /// Regular trading closed.
    NormalClose,
    /// Closing session started.
    ClosingStart,
    /// Closing session ended.
    ClosingEnd,
}

/// Last traded price block. `cp` is the previous close.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Ltpc {
    /// Last traded price.
    pub ltp: f64,
    /// Last trade time, epoch millis.
    pub ltt: i64,
    /// Last traded quantity.
    pub ltq: i64,
    /// Previous close.
    pub cp: f64,
}

/// One depth level.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Quote {
    /// Bid quantity.
    pub bid_q: i64,
    /// Bid price.
    pub bid_p: f64,
    /// Ask quantity.
    pub ask_q: i64,
    /// Ask price.
    pub ask_p: f64,
}

/// Option sensitivities.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
#[allow(missing_docs)]
pub struct OptionGreeks {
    pub delta: f64,
    pub theta: f64,
    pub gamma: f64,
    pub vega: f64,
    pub rho: f64,
}

/// One candle.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Ohlc {
    /// Candle interval, e.g. `1d` or `I1`.
    pub interval: String,
    /// Open price.
    pub open: f64,
    /// High price.
    pub high: f64,
    /// Low price.
    pub low: f64,
    /// Close price.
    pub close: f64,
    /// Traded volume.
    pub vol: i64,
    /// Candle start, epoch millis.
    pub ts: i64,
}

/// Order book depth.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MarketLevel {
    /// Levels, best first.
    pub bid_ask_quote: Vec<Quote>,
}

/// Candles of the instrument.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketOhlc {
    /// One candle per interval.
    pub ohlc: Vec<Ohlc>,
}

/// Full feed of a tradable instrument.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MarketFullFeed {
    /// Last traded price block.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ltpc: Option<Ltpc>,
    /// Order book depth.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub market_level: Option<MarketLevel>,
    /// Greeks, for options.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub option_greeks: Option<OptionGreeks>,
    /// Candles.
    #[serde(rename = "marketOHLC", skip_serializing_if = "Option::is_none")]
    pub market_ohlc: Option<MarketOhlc>,
    /// Average traded price.
    pub atp: f64,
    /// Volume traded today.
    pub vtt: i64,
    /// Open interest.
    pub oi: f64,
    /// Implied volatility.
    pub iv: f64,
    /// Total buy quantity.
    pub tbq: f64,
    /// Total sell quantity.
    pub tsq: f64,
}

/// Full feed of an index.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexFullFeed {
    /// Last traded price block.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ltpc: Option<Ltpc>,
    /// Candles.
    #[serde(rename = "marketOHLC", skip_serializing_if = "Option::is_none")]
    pub market_ohlc: Option<MarketOhlc>,
}

/// Either flavour of full feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FullFeed {
    /// Tradable instrument.
    #[serde(rename = "marketFF")]
    Market(MarketFullFeed),
    /// Index.
    #[serde(rename = "indexFF")]
    Index(IndexFullFeed),
}

/// Top of book plus greeks, sent in `option_greeks` mode.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FirstLevelWithGreeks {
    /// Last traded price block.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ltpc: Option<Ltpc>,
    /// Best bid and ask.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_depth: Option<Quote>,
    /// Greeks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub option_greeks: Option<OptionGreeks>,
    /// Volume traded today.
    pub vtt: i64,
    /// Open interest.
    pub oi: f64,
    /// Implied volatility.
    pub iv: f64,
}

/// Payload of a feed, keyed by its kind on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FeedData {
    /// `ltpc` mode.
    Ltpc(Ltpc),
    /// `full` and `full_d30` modes.
    FullFeed(FullFeed),
    /// `option_greeks` mode.
    FirstLevelWithGreeks(FirstLevelWithGreeks),
}

/// Feed of one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feed {
    /// Payload.
    #[serde(flatten)]
    pub data: FeedData,
    /// Mode the feed was sent in.
    #[serde(default)]
    pub request_mode: RequestMode,
}

impl Feed {
    /// The last traded price block, whatever the feed flavour.
    pub fn ltpc(&self) -> Option<&Ltpc> {
        match &self.data {
            FeedData::Ltpc(ltpc) => Some(ltpc),
            FeedData::FullFeed(FullFeed::Market(ff)) => ff.ltpc.as_ref(),
            FeedData::FullFeed(FullFeed::Index(ff)) => ff.ltpc.as_ref(),
            FeedData::FirstLevelWithGreeks(fl) => fl.ltpc.as_ref(),
        }
    }
}

/// Status of each exchange segment.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MarketInfo {
    /// Keyed by segment, e.g. `NSE_EQ`.
    pub segment_status: BTreeMap<String, MarketStatus>,
}

/// One decoded upstream frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedMessage {
    /// Frame type.
    #[serde(rename = "type")]
    pub kind: FeedType,
    /// Feeds keyed by instrument key.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub feeds: BTreeMap<String, Feed>,
    /// Server time, epoch millis.
    #[serde(default)]
    pub current_ts: i64,
    /// Present on `market_info` frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_info: Option<MarketInfo>,
}

impl FeedSnapshot for FeedMessage {
    fn has_feeds(&self) -> bool {
        !self.feeds.is_empty()
    }
}

impl FeedMessage {
    /// Price summaries for every feed that carries an LTPC block.
    pub fn quotes(&self) -> impl Iterator<Item = QuoteSummary> + '_ {
        self.feeds.iter().filter_map(|(key, feed)| {
            feed.ltpc().map(|ltpc| QuoteSummary::new(key, ltpc))
        })
    }

    /// Summary of the first instrument, the one a single-instrument view shows.
    pub fn first_quote(&self) -> Option<QuoteSummary> {
        self.quotes().next()
    }
}

/// Last price, previous close and change percentage of one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteSummary {
    /// Instrument key, e.g. `NSE_INDEX|Nifty 50`.
    pub instrument_key: String,
    /// Last traded price.
    pub ltp: f64,
    /// Previous close.
    pub prev_close: f64,
    /// `None` when the previous close is unknown (zero).
    pub change_percent: Option<f64>,
}

impl QuoteSummary {
    fn new(instrument_key: &str, ltpc: &Ltpc) -> Self {
        let change_percent = if ltpc.cp != 0.0 {
            Some((ltpc.ltp - ltpc.cp) / ltpc.cp * 100.0)
        } else {
            None
        };
        Self {
            instrument_key: instrument_key.to_string(),
            ltp: ltpc.ltp,
            prev_close: ltpc.cp,
            change_percent,
        }
    }
}

/// Feed detail mode requested in a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedMode {
    /// Last traded price only.
    Ltpc,
    /// Full feed with 5 depth levels.
    #[default]
    Full,
    /// Top of book plus greeks.
    OptionGreeks,
    /// Full feed with 30 depth levels.
    FullD30,
}

impl std::str::FromStr for FeedMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ltpc" => Ok(FeedMode::Ltpc),
            "full" => Ok(FeedMode::Full),
            "option_greeks" => Ok(FeedMode::OptionGreeks),
            "full_d30" => Ok(FeedMode::FullD30),
            other => Err(format!("unknown feed mode '{}'", other)),
        }
    }
}

/// What to subscribe to once the upstream session is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSpec {
    /// Instruments to subscribe to.
    pub instrument_keys: Vec<String>,
    /// Detail mode for all of them.
    pub mode: FeedMode,
}

impl SubscriptionSpec {
    /// Creates a subscription for `instrument_keys` in `mode`.
    pub fn new(instrument_keys: Vec<String>, mode: FeedMode) -> Self {
        Self { instrument_keys, mode }
    }

    /// Builds the control frame with a fresh request id.
    pub fn request(&self) -> SubscriptionRequest {
        SubscriptionRequest {
            guid: format!("guid-{}", chrono::Utc::now().timestamp_millis()),
            method: "sub".to_string(),
            data: SubscriptionData {
                mode: self.mode,
                instrument_keys: self.instrument_keys.clone(),
            },
        }
    }
}

/// `{ guid, method: "sub", data: { mode, instrumentKeys } }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    /// Request id.
    pub guid: String,
    /// Always `sub`.
    pub method: String,
    /// What to subscribe to.
    pub data: SubscriptionData,
}

/// Body of a [`SubscriptionRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionData {
    /// Detail mode.
    pub mode: FeedMode,
    /// Instruments.
    pub instrument_keys: Vec<String>,
}
