//! Technical Indicators
//!
//! Pure functions over a close-price series (oldest first):
//!
//! - RSI with simple rolling means of gains and losses
//! - MACD with adjusted exponentially weighted means
//! - Simple moving averages
//!
//! and the rule set turning the latest values into a [`SignalSummary`].
//! All arithmetic stays in [`Decimal`].

use rust_decimal::Decimal;

use crate::domain::snapshot::{
    Action, Confidence, IndicatorSnapshot, MacdValue, Recommendation, Sentiment, SignalSummary,
};

/// RSI lookback.
pub const RSI_PERIOD: usize = 14;
/// MACD fast span.
pub const MACD_FAST: usize = 12;
/// MACD slow span.
pub const MACD_SLOW: usize = 26;
/// MACD signal span.
pub const MACD_SIGNAL: usize = 9;

const HUNDRED: Decimal = Decimal::from_parts(100, 0, 0, false, 0);
const RSI_OVERBOUGHT: Decimal = Decimal::from_parts(70, 0, 0, false, 0);
const RSI_OVERSOLD: Decimal = Decimal::from_parts(30, 0, 0, false, 0);

/// Latest RSI over `period` using simple rolling means.
///
/// Returns `None` with fewer than `period + 1` prices or when the window has
/// no movement at all. A window with gains and no losses reads 100.
#[must_use]
pub fn rsi(prices: &[Decimal], period: usize) -> Option<Decimal> {
    if period == 0 || prices.len() < period + 1 {
        return None;
    }

    let window = &prices[prices.len() - period - 1..];
    let (gain, loss) = window
        .windows(2)
        .map(|pair| pair[1] - pair[0])
        .fold((Decimal::ZERO, Decimal::ZERO), |(gain, loss), delta| {
            if delta.is_sign_positive() {
                (gain + delta, loss)
            } else {
                (gain, loss - delta)
            }
        });

    let n = Decimal::from(period);
    let (avg_gain, avg_loss) = (gain / n, loss / n);

    if avg_loss.is_zero() {
        return (!avg_gain.is_zero()).then_some(HUNDRED);
    }

    let rs = avg_gain / avg_loss;
    Some(HUNDRED - HUNDRED / (Decimal::ONE + rs))
}

/// Adjusted exponentially weighted mean series with the given span.
///
/// Each output is the weighted average of all inputs so far with weights
/// `(1 - alpha)^age`, `alpha = 2 / (span + 1)`.
#[must_use]
pub fn ewm(values: &[Decimal], span: usize) -> Vec<Decimal> {
    let alpha = Decimal::TWO / Decimal::from(span + 1);
    let decay = Decimal::ONE - alpha;

    let mut numerator = Decimal::ZERO;
    let mut denominator = Decimal::ZERO;
    values
        .iter()
        .map(|value| {
            numerator = numerator * decay + value;
            denominator = denominator * decay + Decimal::ONE;
            numerator / denominator
        })
        .collect()
}

/// Latest MACD(fast, slow, signal).
///
/// Needs at least `slow + signal` prices.
#[must_use]
pub fn macd(prices: &[Decimal], fast: usize, slow: usize, signal: usize) -> Option<MacdValue> {
    if prices.len() < slow + signal {
        return None;
    }

    let fast_line = ewm(prices, fast);
    let slow_line = ewm(prices, slow);
    let macd_line: Vec<Decimal> = fast_line
        .iter()
        .zip(&slow_line)
        .map(|(f, s)| f - s)
        .collect();
    let signal_line = ewm(&macd_line, signal);

    let macd = *macd_line.last()?;
    let signal = *signal_line.last()?;
    Some(MacdValue {
        macd,
        signal,
        histogram: macd - signal,
    })
}

/// Simple moving average of the last `period` prices.
#[must_use]
pub fn sma(prices: &[Decimal], period: usize) -> Option<Decimal> {
    if period == 0 || prices.len() < period {
        return None;
    }
    let window = &prices[prices.len() - period..];
    Some(window.iter().sum::<Decimal>() / Decimal::from(period))
}

/// Turn the latest indicator values into recommendations and a majority
/// sentiment.
#[must_use]
pub fn signal(
    last_price: Decimal,
    rsi: Option<Decimal>,
    macd: Option<MacdValue>,
    sma_20: Option<Decimal>,
) -> SignalSummary {
    let mut recommendations = Vec::new();

    if let Some(rsi) = rsi {
        if rsi > RSI_OVERBOUGHT {
            recommendations.push(Recommendation {
                action: Action::Sell,
                reason: format!("RSI overbought at {rsi:.2}"),
                strength: Confidence::Medium,
            });
        } else if rsi < RSI_OVERSOLD {
            recommendations.push(Recommendation {
                action: Action::Buy,
                reason: format!("RSI oversold at {rsi:.2}"),
                strength: Confidence::Medium,
            });
        }
    }

    if let Some(macd) = macd {
        let (action, reason) = if macd.macd > macd.signal {
            (Action::Buy, "MACD above signal line")
        } else {
            (Action::Sell, "MACD below signal line")
        };
        recommendations.push(Recommendation {
            action,
            reason: reason.to_string(),
            strength: Confidence::Medium,
        });
    }

    if let Some(sma_20) = sma_20
        && last_price > sma_20
    {
        recommendations.push(Recommendation {
            action: Action::Buy,
            reason: "Price above 20-day MA".to_string(),
            strength: Confidence::Low,
        });
    }

    let buys = recommendations
        .iter()
        .filter(|r| r.action == Action::Buy)
        .count();
    let sells = recommendations.len() - buys;

    let share = |n: usize| {
        (Decimal::from(n) * HUNDRED / Decimal::from(recommendations.len()))
            .min(HUNDRED)
            .round_dp(2)
    };

    let (sentiment, strength) = match buys.cmp(&sells) {
        std::cmp::Ordering::Greater => (Sentiment::Bullish, share(buys)),
        std::cmp::Ordering::Less => (Sentiment::Bearish, share(sells)),
        std::cmp::Ordering::Equal => (Sentiment::Neutral, Decimal::ZERO),
    };

    SignalSummary {
        sentiment,
        strength,
        recommendations,
    }
}

/// Compute the full indicator snapshot from a close-price series.
///
/// Returns `None` for an empty series.
#[must_use]
pub fn analyze(prices: &[Decimal]) -> Option<IndicatorSnapshot> {
    let last_price = *prices.last()?;
    let rsi = rsi(prices, RSI_PERIOD);
    let macd = macd(prices, MACD_FAST, MACD_SLOW, MACD_SIGNAL);
    let sma_20 = sma(prices, 20);
    let sma_50 = sma(prices, 50);

    Some(IndicatorSnapshot {
        last_price,
        rsi,
        macd,
        sma_20,
        sma_50,
        signal: signal(last_price, rsi, macd, sma_20),
    })
}
