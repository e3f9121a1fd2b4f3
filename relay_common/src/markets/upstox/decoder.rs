//! # Upstox Frame Decoder
//!
//! Turns binary `FeedResponse` frames into [`FeedMessage`] values. Only an
//! unknown frame `type` rejects the frame. An unknown `requestMode` drops that
//! one feed and an unknown `marketStatus` drops that one segment, so the other
//! instruments in the frame still get through.

use std::collections::BTreeMap;

use prost::Message;

use super::model::{
    Feed, FeedData, FeedMessage, FeedType, FirstLevelWithGreeks, FullFeed, IndexFullFeed, Ltpc,
    MarketFullFeed, MarketInfo, MarketLevel, MarketOhlc, MarketStatus, Ohlc, OptionGreeks, Quote,
    RequestMode,
};
use super::proto_handler as proto;
use crate::core::decoder::FrameDecoder;
use crate::core::error::DecodeError;

/// Stateless decoder for the V3 market data feed.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpstoxDecoder;

impl UpstoxDecoder {
    /// Creates the decoder. It holds no state.
    pub fn new() -> Self {
        Self
    }
}

impl FrameDecoder for UpstoxDecoder {
    type Message = FeedMessage;

    fn decode(&self, frame: &[u8]) -> Result<FeedMessage, DecodeError> {
        if frame.is_empty() {
            return Err(DecodeError::Empty);
        }
        let raw = proto::FeedResponse::decode(frame)
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;
        FeedMessage::try_from(raw)
    }
}

impl TryFrom<proto::FeedResponse> for FeedMessage {
    type Error = DecodeError;

    fn try_from(raw: proto::FeedResponse) -> Result<Self, Self::Error> {
        let kind = match proto::Type::try_from(raw.r#type) {
            Ok(proto::Type::InitialFeed) => FeedType::InitialFeed,
            Ok(proto::Type::LiveFeed) => FeedType::LiveFeed,
            Ok(proto::Type::MarketInfo) => FeedType::MarketInfo,
            Err(_) => return Err(unknown("type", raw.r#type)),
        };

        let mut feeds = BTreeMap::new();
        for (key, feed) in raw.feeds {
            if let Some(feed) = convert_feed(&key, feed) {
                feeds.insert(key, feed);
            }
        }

        let market_info = raw.market_info.map(convert_market_info);

        Ok(FeedMessage {
            kind,
            feeds,
            current_ts: raw.current_ts,
            market_info,
        })
    }
}

fn unknown(field: &'static str, tag: i32) -> DecodeError {
    DecodeError::UnknownTag { field, tag }
}

// `None` when the feed has no payload or a mode this build does not know.
fn convert_feed(key: &str, raw: proto::Feed) -> Option<Feed> {
    let request_mode = match proto::RequestMode::try_from(raw.request_mode) {
        Ok(proto::RequestMode::Ltpc) => RequestMode::Ltpc,
        Ok(proto::RequestMode::FullD5) => RequestMode::FullD5,
        Ok(proto::RequestMode::OptionGreeks) => RequestMode::OptionGreeks,
        Ok(proto::RequestMode::FullD30) => RequestMode::FullD30,
        Err(_) => {
            log::warn!("Dropping feed {}: {}", key, unknown("requestMode", raw.request_mode));
            return None;
        }
    };

    let data = match raw.feed_union {
        None => return None,
        Some(proto::feed::FeedUnion::Ltpc(ltpc)) => FeedData::Ltpc(convert_ltpc(ltpc)),
        Some(proto::feed::FeedUnion::FullFeed(full)) => match full.full_feed_union {
            None => return None,
            Some(proto::full_feed::FullFeedUnion::MarketFf(ff)) => {
                FeedData::FullFeed(FullFeed::Market(convert_market_ff(ff)))
            }
            Some(proto::full_feed::FullFeedUnion::IndexFf(ff)) => {
                FeedData::FullFeed(FullFeed::Index(IndexFullFeed {
                    ltpc: ff.ltpc.map(convert_ltpc),
                    market_ohlc: ff.market_ohlc.map(convert_ohlc),
                }))
            }
        },
        Some(proto::feed::FeedUnion::FirstLevelWithGreeks(fl)) => {
            FeedData::FirstLevelWithGreeks(FirstLevelWithGreeks {
                ltpc: fl.ltpc.map(convert_ltpc),
                first_depth: fl.first_depth.map(convert_quote),
                option_greeks: fl.option_greeks.map(convert_greeks),
                vtt: fl.vtt,
                oi: fl.oi,
                iv: fl.iv,
            })
        }
    };

    Some(Feed { data, request_mode })
}

fn convert_ltpc(raw: proto::Ltpc) -> Ltpc {
    Ltpc {
        ltp: raw.ltp,
        ltt: raw.ltt,
        ltq: raw.ltq,
        cp: raw.cp,
    }
}

fn convert_quote(raw: proto::Quote) -> Quote {
    Quote {
        bid_q: raw.bid_q,
        bid_p: raw.bid_p,
        ask_q: raw.ask_q,
        ask_p: raw.ask_p,
    }
}

fn convert_greeks(raw: proto::OptionGreeks) -> OptionGreeks {
    OptionGreeks {
        delta: raw.delta,
        theta: raw.theta,
        gamma: raw.gamma,
        vega: raw.vega,
        rho: raw.rho,
    }
}

fn convert_ohlc(raw: proto::MarketOhlc) -> MarketOhlc {
    MarketOhlc {
        ohlc: raw
            .ohlc
            .into_iter()
            .map(|c| Ohlc {
                interval: c.interval,
                open: c.open,
                high: c.high,
                low: c.low,
                close: c.close,
                vol: c.vol,
                ts: c.ts,
            })
            .collect(),
    }
}

fn convert_market_ff(raw: proto::MarketFullFeed) -> MarketFullFeed {
    MarketFullFeed {
        ltpc: raw.ltpc.map(convert_ltpc),
        market_level: raw.market_level.map(|level| MarketLevel {
            bid_ask_quote: level.bid_ask_quote.into_iter().map(convert_quote).collect(),
        }),
        option_greeks: raw.option_greeks.map(convert_greeks),
        market_ohlc: raw.market_ohlc.map(convert_ohlc),
        atp: raw.atp,
        vtt: raw.vtt,
        oi: raw.oi,
        iv: raw.iv,
        tbq: raw.tbq,
        tsq: raw.tsq,
    }
}

fn convert_market_info(raw: proto::MarketInfo) -> MarketInfo {
    let mut segment_status = BTreeMap::new();
    for (segment, tag) in raw.segment_status {
        let status = match proto::MarketStatus::try_from(tag) {
            Ok(proto::MarketStatus::PreOpenStart) => MarketStatus::PreOpenStart,
            Ok(proto::MarketStatus::PreOpenEnd) => MarketStatus::PreOpenEnd,
            Ok(proto::MarketStatus::NormalOpen) => MarketStatus::NormalOpen,
            Ok(proto::MarketStatus::NormalClose) => MarketStatus::NormalClose,
            Ok(proto::MarketStatus::ClosingStart) => MarketStatus::ClosingStart,
            Ok(proto::MarketStatus::ClosingEnd) => MarketStatus::ClosingEnd,
            Err(_) => {
                log::warn!("Skipping segment {}: {}", segment, unknown("marketStatus", tag));
                continue;
            }
        };
        segment_status.insert(segment, status);
    }
    MarketInfo { segment_status }
}
