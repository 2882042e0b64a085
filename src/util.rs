/// Utility helpers used by all collectors.
///
/// This module contains:
/// - Time helpers (epoch conversion)
/// - Instrument name conversion into the canonical layout
/// - Defensive JSON field coercion
/// - Table routing
///
/// IMPORTANT:
/// - No I/O happens here.
/// - Exchange-specific payload shapes belong in `exchanges`.
///
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde_json::Value;

/// Returns the current Unix timestamp in milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Converts an exchange epoch value into an absolute time.
///
/// Exchanges disagree on units. Values at or above 10^12 are treated
/// as milliseconds, smaller positive values as seconds.
/// Non-positive values yield `None`.
pub fn epoch_to_datetime(epoch: i64) -> Option<DateTime<Utc>> {
    if epoch <= 0 {
        return None;
    }
    if epoch >= 1_000_000_000_000 {
        Utc.timestamp_millis_opt(epoch).single()
    } else {
        Utc.timestamp_opt(epoch, 0).single()
    }
}

/// Converts an exchange date code `YYMMDD` into `DDMMMYY`.
///
/// Example: "240329" -> "29MAR24"
pub fn convert_date_code(code: &str) -> Option<String> {
    if code.len() != 6 || !code.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let date = NaiveDate::parse_from_str(code, "%y%m%d").ok()?;
    Some(date.format("%d%b%y").to_string().to_uppercase())
}

fn is_option_marker(token: &str) -> bool {
    token == "C" || token == "P"
}

/// Reformats an instrument name into the canonical token layout
/// `CURRENCY-DDMMMYY-STRIKE-TYPE`.
///
/// Accepted encodings:
/// - `BTC-USD-240329-60000-C`   (OKX, currency-quote-date-strike-type)
/// - `BTC-240329-60000-C`       (Binance, currency-date-strike-type)
/// - `BTC-29MAR24-60000-C-USDT` (Bybit, trailing settle coin)
/// - `BTC-29MAR24-60000-C`      (already canonical)
///
/// Returns `None` for anything else.
pub fn canonical_instrument(raw: &str) -> Option<String> {
    let parts: Vec<&str> = raw.split('-').collect();

    let (currency, date, strike, kind) = match parts.as_slice() {
        [cur, _quote, date, strike, kind] if is_option_marker(kind) => (*cur, *date, *strike, *kind),
        [cur, date, strike, kind, _settle] if is_option_marker(kind) => (*cur, *date, *strike, *kind),
        [cur, date, strike, kind] if is_option_marker(kind) => (*cur, *date, *strike, *kind),
        _ => return None,
    };

    let date = if date.chars().all(|c| c.is_ascii_digit()) {
        convert_date_code(date)?
    } else {
        date.to_uppercase()
    };

    Some(format!("{currency}-{date}-{strike}-{kind}"))
}

/// Same as [`canonical_instrument`], falling back to the raw name
/// when the layout is not recognized.
pub fn normalize_instrument(raw: &str) -> String {
    canonical_instrument(raw).unwrap_or_else(|| raw.to_string())
}

/// Option filter based on the naming convention.
///
/// Tokens are split on `-`; an option has at least four tokens and
/// its type marker (`C` / `P`) is the last or second-to-last token.
pub fn is_option_instrument(name: &str) -> bool {
    let parts: Vec<&str> = name.split('-').collect();
    if parts.len() < 4 {
        return false;
    }
    let last = parts[parts.len() - 1];
    let second_last = parts[parts.len() - 2];
    is_option_marker(last) || is_option_marker(second_last)
}

// ------------------------------------------------------------
// Defensive field coercion
// ------------------------------------------------------------
//
// Exchanges send numbers both as JSON numbers and as strings.
// These helpers never panic; anything unparsable becomes None.
//

pub fn value_f64(v: Option<&Value>) -> Option<f64> {
    match v? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) if !s.trim().is_empty() => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|f| f.is_finite())
}

pub fn value_i64(v: Option<&Value>) -> Option<i64> {
    match v? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// String form of an identifier that may arrive as number or string.
/// Empty strings are treated as absent.
pub fn value_string(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ------------------------------------------------------------
// Table routing
// ------------------------------------------------------------

/// `{exchange}_{currency}_trades`
pub fn trades_table(exchange: &str, currency: &str) -> String {
    format!("{}_{}_trades", exchange, currency.to_lowercase())
}

/// `{exchange}_{currency}_block_trades`
pub fn block_trades_table(exchange: &str, currency: &str) -> String {
    format!("{}_{}_block_trades", exchange, currency.to_lowercase())
}

/// `ohlc_{currency}`
pub fn candles_table(currency: &str) -> String {
    format!("ohlc_{}", currency.to_lowercase())
}

/// Table and column names are interpolated into SQL, so only
/// lowercase ASCII, digits and underscores are accepted.
pub fn is_safe_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
