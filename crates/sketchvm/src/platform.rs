use crate::error::{Diagnostic, ErrorKind};

/// Named bundle of predefined macros, pin constants, auto-active libraries,
/// and word sizes for one target board. Immutable after construction; the
/// built-in table is the only constructor.
#[derive(Debug)]
pub struct PlatformProfile {
    /// Platform identifier, e.g. `ARDUINO_UNO`.
    pub id: &'static str,
    /// Predefined macros injected before user `#define`s run.
    pub defines: &'static [(&'static str, &'static str)],
    /// Libraries active without an `#include`.
    pub libraries: &'static [&'static str],
    /// Analog pin aliases and the pin numbers they resolve to.
    pub analog_pins: &'static [(&'static str, i64)],
    pub clock_hz: u64,
    /// `sizeof(int)` on this target.
    pub int_bytes: u8,
    /// `sizeof(void*)` on this target.
    pub pointer_bytes: u8,
    pub led_builtin: i64,
}

const COMMON_DEFINES: &[(&str, &str)] = &[
    ("HIGH", "1"),
    ("LOW", "0"),
    ("INPUT", "0"),
    ("OUTPUT", "1"),
    ("INPUT_PULLUP", "2"),
    ("PI", "3.1415926535897932384626433832795"),
    ("HALF_PI", "1.5707963267948966192313216916398"),
    ("TWO_PI", "6.283185307179586476925286766559"),
    ("DEG_TO_RAD", "0.017453292519943295769236907684886"),
    ("RAD_TO_DEG", "57.295779513082320876798154814105"),
    ("NULL", "0"),
];

const UNO_DEFINES: &[(&str, &str)] = &[
    ("ARDUINO", "10607"),
    ("ARDUINO_ARCH_AVR", "1"),
    ("ARDUINO_AVR_UNO", "1"),
    ("__AVR__", "1"),
    ("F_CPU", "16000000L"),
    ("LED_BUILTIN", "13"),
    ("A0", "14"),
    ("A1", "15"),
    ("A2", "16"),
    ("A3", "17"),
    ("A4", "18"),
    ("A5", "19"),
];

const ESP32_NANO_DEFINES: &[(&str, &str)] = &[
    ("ARDUINO", "10607"),
    ("ARDUINO_ARCH_ESP32", "1"),
    ("ARDUINO_NANO_ESP32", "1"),
    ("ESP32", "1"),
    ("F_CPU", "240000000L"),
    ("LED_BUILTIN", "13"),
    ("A0", "14"),
    ("A1", "15"),
    ("A2", "16"),
    ("A3", "17"),
    ("A4", "18"),
    ("A5", "19"),
    ("A6", "20"),
    ("A7", "21"),
];

const UNO_ANALOG_PINS: &[(&str, i64)] = &[
    ("A0", 14),
    ("A1", 15),
    ("A2", 16),
    ("A3", 17),
    ("A4", 18),
    ("A5", 19),
];

const ESP32_ANALOG_PINS: &[(&str, i64)] = &[
    ("A0", 14),
    ("A1", 15),
    ("A2", 16),
    ("A3", 17),
    ("A4", 18),
    ("A5", 19),
    ("A6", 20),
    ("A7", 21),
];

static PROFILES: &[PlatformProfile] = &[
    PlatformProfile {
        id: "ARDUINO_UNO",
        defines: UNO_DEFINES,
        libraries: &["Serial"],
        analog_pins: UNO_ANALOG_PINS,
        clock_hz: 16_000_000,
        int_bytes: 2,
        pointer_bytes: 2,
        led_builtin: 13,
    },
    PlatformProfile {
        id: "ESP32_NANO",
        defines: ESP32_NANO_DEFINES,
        libraries: &["Serial", "WiFi"],
        analog_pins: ESP32_ANALOG_PINS,
        clock_hz: 240_000_000,
        int_bytes: 4,
        pointer_bytes: 4,
        led_builtin: 13,
    },
];

impl PlatformProfile {
    /// Looks up a profile by platform id.
    pub fn lookup(id: &str) -> Result<&'static Self, Diagnostic> {
        PROFILES.iter().find(|p| p.id == id).ok_or_else(|| {
            Diagnostic::error(ErrorKind::UnknownPlatform, format!("unknown platform `{id}`"), 1)
        })
    }

    /// All supported platform ids, for host enumeration.
    #[must_use]
    pub fn ids() -> Vec<&'static str> {
        PROFILES.iter().map(|p| p.id).collect()
    }

    /// Iterates board-specific and common predefined macros.
    pub(crate) fn all_defines(&self) -> impl Iterator<Item = (&'static str, &'static str)> + '_ {
        self.defines.iter().chain(COMMON_DEFINES.iter()).copied()
    }

    /// Maps a pin number back to its analog alias, if it has one.
    ///
    /// Used when emitting `ANALOG_READ_REQUEST` so the command payload shows
    /// `"A0"` rather than the raw pin number.
    #[must_use]
    pub fn analog_pin_name(&self, pin: i64) -> Option<&'static str> {
        self.analog_pins.iter().find(|(_, n)| *n == pin).map(|(name, _)| *name)
    }

    /// Resolves an analog alias to its pin number.
    #[must_use]
    pub fn analog_pin_number(&self, name: &str) -> Option<i64> {
        self.analog_pins.iter().find(|(n, _)| *n == name).map(|(_, pin)| *pin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_known_platforms() {
        assert_eq!(PlatformProfile::lookup("ARDUINO_UNO").unwrap().int_bytes, 2);
        assert_eq!(PlatformProfile::lookup("ESP32_NANO").unwrap().int_bytes, 4);
    }

    #[test]
    fn lookup_unknown_platform_fails() {
        let err = PlatformProfile::lookup("TEENSY_41").unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownPlatform);
    }

    #[test]
    fn analog_alias_round_trip() {
        let uno = PlatformProfile::lookup("ARDUINO_UNO").unwrap();
        let pin = uno.analog_pin_number("A0").unwrap();
        assert_eq!(uno.analog_pin_name(pin), Some("A0"));
    }
}
