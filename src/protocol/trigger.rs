//! Trigger conditions deciding when a sampler starts and stops.

use num_derive::FromPrimitive;
use zerocopy::AsBytes;

use crate::OdIndex;

/// The condition of a [`SamplerTrigger`].
///
/// Conditions are evaluated once per sampling tick against the two freshest
/// observations of the trigger address (`previous` and `current`). For the bit
/// conditions the trigger value is a zero-based bit number, for the others it is
/// compared as a signed 32-bit integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, AsBytes)]
#[repr(u8)]
pub enum TriggerCondition {
    /// Never. Marks an absent trigger.
    False = 0x00,
    /// Immediately.
    True = 0x01,
    /// `current & (1 << value) != 0`
    Set = 0x10,
    /// `current & (1 << value) == 0`
    Clear = 0x11,
    /// The bit is clear in `previous` and set in `current`.
    RisingEdge = 0x12,
    /// The bit is set in `previous` and clear in `current`.
    FallingEdge = 0x13,
    /// The bit differs between `previous` and `current`.
    BitToggle = 0x14,
    /// `current > value`
    Greater = 0x15,
    /// `current >= value`
    GreaterOrEqual = 0x16,
    /// `current < value`
    Less = 0x17,
    /// `current <= value`
    LessOrEqual = 0x18,
    /// `current == value`
    Equal = 0x19,
    /// `current != value`
    NotEqual = 0x1A,
    /// `value > 0 ? current - previous > value : current - previous < value`
    OneEdge = 0x1B,
    /// `abs(previous - current) > abs(value)`
    MultiEdge = 0x1C,
}

impl TriggerCondition {
    /// `TC_FALSE` and `TC_TRUE` never look at the trigger address.
    pub fn requires_address(&self) -> bool {
        !matches!(self, TriggerCondition::False | TriggerCondition::True)
    }

    /// Evaluates the condition. `value` is the trigger value or bit number.
    pub fn evaluate(&self, previous: i64, current: i64, value: u32) -> bool {
        // comparisons and deltas use the trigger value as a signed 32-bit number
        let threshold = i64::from(value as i32);

        match self {
            TriggerCondition::False => false,
            TriggerCondition::True => true,
            TriggerCondition::Set => bit_is_set(current, value),
            TriggerCondition::Clear => !bit_is_set(current, value),
            TriggerCondition::RisingEdge => {
                !bit_is_set(previous, value) && bit_is_set(current, value)
            }
            TriggerCondition::FallingEdge => {
                bit_is_set(previous, value) && !bit_is_set(current, value)
            }
            TriggerCondition::BitToggle => bit_is_set(previous, value) != bit_is_set(current, value),
            TriggerCondition::Greater => current > threshold,
            TriggerCondition::GreaterOrEqual => current >= threshold,
            TriggerCondition::Less => current < threshold,
            TriggerCondition::LessOrEqual => current <= threshold,
            TriggerCondition::Equal => current == threshold,
            TriggerCondition::NotEqual => current != threshold,
            TriggerCondition::OneEdge => {
                let delta = i128::from(current) - i128::from(previous);
                if threshold > 0 {
                    delta > i128::from(threshold)
                } else {
                    delta < i128::from(threshold)
                }
            }
            TriggerCondition::MultiEdge => {
                (i128::from(previous) - i128::from(current)).abs() > i128::from(threshold).abs()
            }
        }
    }
}

fn bit_is_set(value: i64, bit: u32) -> bool {
    1u64.checked_shl(bit).map_or(false, |mask| (value as u64) & mask != 0)
}

/// A trigger: a condition on an OD address with a value or bit number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerTrigger {
    /// The trigger condition
    pub condition: TriggerCondition,
    /// OD address of the trigger
    pub address: OdIndex,
    /// Condition value or bit number. Bit numbering starts at zero.
    pub value: u32,
}

impl SamplerTrigger {
    /// Creates a new [`SamplerTrigger`].
    pub fn new(condition: TriggerCondition, address: OdIndex, value: u32) -> Self {
        Self {
            condition,
            address,
            value,
        }
    }

    /// A trigger that fires on the first evaluation.
    pub fn immediate() -> Self {
        Self::new(TriggerCondition::True, OdIndex::default(), 0)
    }

    /// Absent triggers use `TC_FALSE`.
    pub fn is_set(&self) -> bool {
        self.condition != TriggerCondition::False
    }

    /// Evaluates the trigger against two observations of its address.
    pub fn is_met(&self, previous: i64, current: i64) -> bool {
        self.condition.evaluate(previous, current, self.value)
    }
}

impl Default for SamplerTrigger {
    fn default() -> Self {
        Self::new(TriggerCondition::False, OdIndex::default(), 0)
    }
}
