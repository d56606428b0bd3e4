use query_api::StreamError;

/// Credit a consumer has granted its producer.
///
/// Never negative. Reaching `i64::MAX` (or overflowing) saturates at
/// `Unlimited` instead of wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Demand {
    Limited(u64),
    Unlimited,
}

impl Default for Demand {
    fn default() -> Self {
        Demand::Limited(0)
    }
}

impl Demand {
    /// Grant `n` more items. Negative requests are a usage fault.
    pub fn request(self, n: i64) -> Result<Demand, StreamError> {
        if n < 0 {
            return Err(StreamError::usage(format!("request_more({n}): demand must not be negative")));
        }
        let n = n as u64;
        Ok(match self {
            Demand::Unlimited => Demand::Unlimited,
            Demand::Limited(current) => match current.checked_add(n) {
                Some(total) if total < i64::MAX as u64 => Demand::Limited(total),
                _ => Demand::Unlimited,
            },
        })
    }

    /// Account for one delivered item.
    pub fn consume(&mut self) {
        if let Demand::Limited(n) = self {
            *n = n.saturating_sub(1);
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Demand::Limited(0)
    }

    pub fn is_unlimited(&self) -> bool {
        *self == Demand::Unlimited
    }
}
