//! Stop conditions for the frame loop: Ctrl+C or a held key
//!
//! The key is polled with QueryKeymap once per frame instead of grabbing
//! it, so the overlay never steals keyboard focus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use x11rb::connection::Connection;
use x11rb::protocol::xproto::ConnectionExt;

use crate::error::CaptureResult;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum StopKey {
    #[default]
    Escape,
    Q,
    F12,
}

impl StopKey {
    pub fn keysym(self) -> u32 {
        match self {
            StopKey::Escape => 0xff1b,
            StopKey::Q => 0x0071,
            StopKey::F12 => 0xffc9,
        }
    }
}

/// Find the keycode producing `keysym` in a GetKeyboardMapping table
pub fn keycode_for_keysym(
    min_keycode: u8,
    keysyms_per_keycode: u8,
    keysyms: &[u32],
    keysym: u32,
) -> Option<u8> {
    if keysyms_per_keycode == 0 {
        return None;
    }
    keysyms
        .chunks(keysyms_per_keycode as usize)
        .position(|syms| syms.contains(&keysym))
        .and_then(|offset| u8::try_from(min_keycode as usize + offset).ok())
}

/// Whether `keycode` is down in a QueryKeymap bit vector
pub fn key_pressed(keys: &[u8; 32], keycode: u8) -> bool {
    keys[keycode as usize / 8] & (1 << (keycode % 8)) != 0
}

pub struct StopSignal {
    interrupted: Arc<AtomicBool>,
    keycode: Option<u8>,
}

impl StopSignal {
    /// `interrupted` is shared with the Ctrl+C handler.
    pub fn new<C: Connection>(
        conn: &C,
        key: StopKey,
        interrupted: Arc<AtomicBool>,
    ) -> CaptureResult<Self> {
        let setup = conn.setup();
        let (min, max) = (setup.min_keycode, setup.max_keycode);
        let mapping = conn
            .get_keyboard_mapping(min, max.saturating_sub(min).saturating_add(1))?
            .reply()?;

        let keycode = keycode_for_keysym(
            min,
            mapping.keysyms_per_keycode,
            &mapping.keysyms,
            key.keysym(),
        );
        match keycode {
            Some(code) => log::debug!("stop key {key:?} is keycode {code}"),
            None => log::warn!("stop key {key:?} is not on the keyboard, only Ctrl+C will stop"),
        }

        Ok(Self {
            interrupted,
            keycode,
        })
    }

    pub fn should_stop<C: Connection>(&self, conn: &C) -> bool {
        if self.interrupted.load(Ordering::SeqCst) {
            return true;
        }

        let Some(keycode) = self.keycode else {
            return false;
        };
        match conn.query_keymap().map(|cookie| cookie.reply()) {
            Ok(Ok(reply)) => key_pressed(&reply.keys, keycode),
            Ok(Err(e)) => {
                log::warn!("QueryKeymap failed: {e}");
                false
            }
            Err(e) => {
                log::warn!("QueryKeymap failed: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keycode_for_keysym() {
        // Keycodes 8..=11, two keysyms each
        let keysyms = [0x61, 0x41, 0xff1b, 0, 0x71, 0x51, 0xffc9, 0];
        assert_eq!(keycode_for_keysym(8, 2, &keysyms, StopKey::Escape.keysym()), Some(9));
        assert_eq!(keycode_for_keysym(8, 2, &keysyms, StopKey::Q.keysym()), Some(10));
        assert_eq!(keycode_for_keysym(8, 2, &keysyms, StopKey::F12.keysym()), Some(11));
        assert_eq!(keycode_for_keysym(8, 2, &keysyms, 0xffff), None);
        assert_eq!(keycode_for_keysym(8, 0, &keysyms, 0x61), None);
    }

    #[test]
    fn test_key_pressed() {
        let mut keys = [0u8; 32];
        keys[1] = 0b0000_0010;
        assert!(key_pressed(&keys, 9));
        assert!(!key_pressed(&keys, 8));
        assert!(!key_pressed(&keys, 255));
    }
}
