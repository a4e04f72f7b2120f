//! Pin handler sets. Real hardware adapters (GPIO, ADC, 1-wire,
//! weather stations, accelerometer, I2S audio, SSH-to-router shell,
//! CPU/memory probes) are out of scope (§1) — only the contract they
//! satisfy is specified (`ns_pins::PinReader`/`PinWriter`). This module
//! provides the two handler sets the CLI can select between: a null set
//! (every pin stays unset — useful for protocol-only testing) and a
//! small simulated set standing in for real hardware during development,
//! covering the reserved `X2x` CPU/memory pins from §6.

use std::sync::Arc;

use ns_pins::{HandlerError, Pin, PinHandlers, PinReader};
use ns_protocol::reserved_pins;

/// No handlers registered for any pin kind — every input pin is reported
/// as `value=-1`. Matches what a variant with no configured sensors
/// would see.
pub fn live_handlers() -> PinHandlers {
    // Real hardware wiring is a variant-specific concern (§1 Non-goals);
    // a production build substitutes its own `PinHandlers` here.
    PinHandlers::new()
}

/// A handler set that fabricates plausible values for the reserved
/// `X20`/`X21`/`X22` (CPU temp/usage/virtual memory) pins, for exercising
/// the reconciliation loop without real sensors attached.
pub fn simulated_handlers() -> PinHandlers {
    PinHandlers::new().with_reader('X', Arc::new(SimulatedSystemReader))
}

struct SimulatedSystemReader;

impl PinReader for SimulatedSystemReader {
    fn read(&self, pin: &mut Pin) -> Result<(), HandlerError> {
        let value = match pin.name.as_str() {
            reserved_pins::CPU_TEMP => 45,
            reserved_pins::CPU_USAGE => 12,
            reserved_pins::VIRTUAL_MEM => 512,
            _ => return Ok(()),
        };
        pin.value = value;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_reader_fills_reserved_system_pins() {
        let handlers = simulated_handlers();
        let mut pin = Pin::unset(reserved_pins::CPU_TEMP);
        handlers.dispatch_read(&mut pin).unwrap();
        assert_eq!(pin.value, 45);
    }

    #[test]
    fn simulated_reader_ignores_unrelated_pin_names() {
        let handlers = simulated_handlers();
        let mut pin = Pin::unset("X99");
        handlers.dispatch_read(&mut pin).unwrap();
        assert_eq!(pin.value, ns_pins::UNSET);
    }

    #[test]
    fn live_handlers_leave_every_pin_unset() {
        let handlers = live_handlers();
        let mut pin = Pin::unset(reserved_pins::CPU_TEMP);
        handlers.dispatch_read(&mut pin).unwrap();
        assert_eq!(pin.value, ns_pins::UNSET);
    }
}
