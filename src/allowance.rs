/// Approval amount requested whenever an approval is needed at all.
/// Approving the maximum once spares the user a fresh approval on every
/// subsequent purchase.
pub const MAX_ALLOWANCE: u128 = u128::MAX;

/// Allowance reading taken at the start of a purchase attempt, paired
/// with the cost of the attempt. Always built from a fresh chain read;
/// an allowance can change underneath the client at any time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllowanceState {
    pub current_allowance: u128,
    pub amount_needed: u128,
}

impl AllowanceState {
    pub fn needs_approval(&self) -> bool {
        needs_approval(self.current_allowance, self.amount_needed)
    }
}

/// Whether an approval transaction must precede the purchase.
pub fn needs_approval(current_allowance: u128, amount_needed: u128) -> bool {
    current_allowance < amount_needed
}

/// Total cost of `quantity` tickets in token base units, at the token's
/// decimal precision. `None` on overflow.
pub fn ticket_cost(quantity: u32, price_tokens: u64, decimals: u8) -> Option<u128> {
    let scale = 10u128.checked_pow(u32::from(decimals))?;
    u128::from(quantity)
        .checked_mul(u128::from(price_tokens))?
        .checked_mul(scale)
}
