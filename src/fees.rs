//! Fixed-point fee and amount conversion between on-chain and Lightning
//! amounts, mirroring the swap server's own rounding so both sides agree
//! bit-for-bit on every quoted amount.

use crate::error::{Error, Result};

/// `DUST_THRESHOLD` matches the conservative P2WSH dust limit used by the
/// reference wallet (330 sats for a witness output at 3 sat/vbyte floor).
pub const DUST_THRESHOLD: u64 = 330;

/// Size, in vbytes, of the single-input claim/refund transaction.
pub const CLAIM_FEE_SIZE: u64 = 136;
/// Size, in vbytes, the server budgets for its own on-chain lockup tx.
pub const LOCKUP_FEE_SIZE: u64 = 153;

fn ceil_div(numerator: u128, denominator: u128) -> u128 {
    (numerator + denominator - 1) / denominator
}

/// `percentage` is stored as parts-per-10_000 (e.g. 0.5% == 50) so the
/// calculator works entirely in integer arithmetic, per the fixed-point
/// port of the source's `Decimal`-based math.
#[derive(Debug, Clone, Copy)]
pub struct FeeCalculator {
    pub percentage_bps: u32,
    pub normal_fee: u64,
    pub lockup_fee: u64,
    pub claim_fee: u64,
    pub min_amount: u64,
    pub max_amount: u64,
}

impl FeeCalculator {
    fn check_in_range(&self, amount: u64) -> Option<u64> {
        if amount >= self.min_amount && amount <= self.max_amount {
            Some(amount)
        } else {
            None
        }
    }

    fn ceil_percentage(&self, amount: u64, denom_bps: u32) -> u64 {
        ceil_div(
            amount as u128 * self.percentage_bps as u128,
            denom_bps as u128,
        ) as u64
    }

    /// Internal inversion matching the server's own fee math (does not
    /// include the on-chain claim fee, which `get_recv_amount` layers on).
    fn internal_recv_from_send(&self, send: u64, is_reverse: bool) -> Option<u64> {
        if is_reverse {
            self.check_in_range(send)?;
            let percentage_fee = self.ceil_percentage(send, 10_000);
            let deducted = send.checked_sub(percentage_fee)?.checked_sub(self.lockup_fee)?;
            if deducted < DUST_THRESHOLD {
                None
            } else {
                Some(deducted)
            }
        } else {
            let x = send.checked_sub(self.normal_fee)?;
            let percentage_fee = ceil_div(
                x as u128 * self.percentage_bps as u128,
                (10_000 + self.percentage_bps) as u128,
            ) as u64;
            let x = x.checked_sub(percentage_fee)?;
            self.check_in_range(x)
        }
    }

    fn internal_send_from_recv(&self, recv: u64, is_reverse: bool) -> Option<u64> {
        if is_reverse {
            let x = recv.checked_add(self.lockup_fee)?;
            // x_send = ceil(x / ((10_000 - bps) / 10_000)) = ceil(x * 10_000 / (10_000 - bps))
            let denom = 10_000u128.checked_sub(self.percentage_bps as u128)?;
            let send = ceil_div(x as u128 * 10_000, denom) as u64;
            self.check_in_range(send)
        } else {
            self.check_in_range(recv)?;
            let percentage_fee = self.ceil_percentage(recv, 10_000);
            Some(recv + percentage_fee + self.normal_fee)
        }
    }

    /// Returns how much the counterparty receives for `send`, verifying the
    /// calculation round-trips (within ±1 for the reverse direction, exactly
    /// for forward) and layering the on-chain claim fee on top for reverse
    /// swaps, matching `get_recv_amount` in the source.
    pub fn recv_from_send(&self, send: u64, is_reverse: bool) -> Result<Option<u64>> {
        let Some(recv) = self.internal_recv_from_send(send, is_reverse) else {
            return Ok(None);
        };

        if let Some(inverted_send) = self.internal_send_from_recv(recv, is_reverse) {
            let diff = send.abs_diff(inverted_send);
            let tolerance = if is_reverse { 1 } else { 0 };
            if diff > tolerance {
                return Err(Error::InvariantViolation(format!(
                    "calc-invert-sanity-check failed: is_reverse={is_reverse} send={send} recv={recv} inverted_send={inverted_send}"
                )));
            }
        }

        let recv = if is_reverse {
            match recv.checked_sub(self.claim_fee) {
                Some(v) => v,
                None => return Ok(None),
            }
        } else {
            recv
        };

        Ok(Some(recv))
    }

    /// Returns how much must be sent to yield `recv`, the inverse of
    /// `recv_from_send`, matching `get_send_amount` in the source.
    pub fn send_from_recv(&self, recv: u64, is_reverse: bool) -> Result<Option<u64>> {
        let recv_internal = if is_reverse {
            recv + self.claim_fee
        } else {
            recv
        };

        let Some(send) = self.internal_send_from_recv(recv_internal, is_reverse) else {
            return Ok(None);
        };

        if let Some(inverted_recv) = self.internal_recv_from_send(send, is_reverse)
            && inverted_recv != recv_internal
        {
            return Err(Error::InvariantViolation(format!(
                "calc-invert-sanity-check failed: is_reverse={is_reverse} recv={recv_internal} send={send} inverted_recv={inverted_recv}"
            )));
        }

        Ok(Some(send))
    }

    /// A convenience bound combining the fee schedule with how much the
    /// Lightning layer reports it can currently receive inbound, so a
    /// wallet UI can grey out amounts before the user even tries.
    pub fn max_amount_forward_swap(&self, max_receivable_ln: u64) -> Result<u64> {
        let by_pairs = self.max_amount;
        match self.recv_from_send(by_pairs, false)? {
            Some(recv) if recv <= max_receivable_ln => Ok(by_pairs),
            _ => {
                let mut lo = self.min_amount;
                let mut hi = by_pairs;
                while lo < hi {
                    let mid = lo + (hi - lo + 1) / 2;
                    let fits = matches!(self.recv_from_send(mid, false)?, Some(r) if r <= max_receivable_ln);
                    if fits {
                        lo = mid;
                    } else {
                        hi = mid - 1;
                    }
                }
                Ok(lo)
            }
        }
    }

    /// Build a `FeeCalculator` from the raw `GET /getpairs` response for the
    /// `BTC/BTC` pair.
    pub fn from_pairs_response(resp: &crate::api::types::PairsResponse) -> Result<Self> {
        let pair = resp
            .pairs
            .get("BTC/BTC")
            .ok_or_else(|| Error::Parse("missing BTC/BTC pair".into()))?;
        let percentage_bps = (pair.fees.percentage * 100.0).round() as u32;
        Ok(FeeCalculator {
            percentage_bps,
            normal_fee: pair.fees.miner_fees.base_asset.normal,
            lockup_fee: pair.fees.miner_fees.base_asset.reverse.lockup,
            claim_fee: pair.fees.miner_fees.base_asset.reverse.claim,
            min_amount: pair.limits.minimal,
            max_amount: pair.limits.maximal,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calc() -> FeeCalculator {
        FeeCalculator {
            percentage_bps: 50, // 0.5%
            normal_fee: 500,
            lockup_fee: 1_000,
            claim_fee: 136,
            min_amount: 1_000,
            max_amount: 10_000_000,
        }
    }

    #[test]
    fn reverse_round_trip_within_tolerance() {
        let c = calc();
        let send = 100_000u64;
        let recv = c.recv_from_send(send, true).unwrap().unwrap();
        let inverted = c.send_from_recv(recv, true).unwrap().unwrap();
        assert!(send.abs_diff(inverted) <= 1);
    }

    #[test]
    fn forward_round_trip_is_exact() {
        let c = calc();
        let send = 50_000u64;
        let recv = c.recv_from_send(send, false).unwrap().unwrap();
        let inverted = c.send_from_recv(recv, false).unwrap().unwrap();
        assert_eq!(send, inverted);
    }

    #[test]
    fn below_min_returns_none() {
        let c = calc();
        assert!(c.recv_from_send(10, false).unwrap().is_none());
    }

    #[test]
    fn reverse_internal_matches_spec_example() {
        // percentage = 0.5%, lockup_fee = 1000, send = 100_000
        let c = FeeCalculator {
            percentage_bps: 50,
            normal_fee: 0,
            lockup_fee: 1_000,
            claim_fee: 0,
            min_amount: 0,
            max_amount: 10_000_000,
        };
        let recv = c.internal_recv_from_send(100_000, true).unwrap();
        assert_eq!(recv, 98_500);
    }
}
