/// Global reload hotkey that fires even when the launched program (or any other
/// window) has focus.
///
/// Backends:
/// - Windows: a low-level keyboard hook (`WH_KEYBOARD_LL`) on a dedicated OS
///   thread with its own message pump.  The thread exits cleanly when
///   [`HotkeyHandle::stop`] is called.
/// - Linux and the BSDs: an X11 key grab through `global-hotkey`, released on
///   stop.  Needs an X server (or XWayland) reachable through `DISPLAY`.
/// - macOS: an `rdev` event tap on a listener thread.  The process needs the
///   Accessibility permission.  The tap cannot be removed, so stopping only
///   disarms it.
///
/// Anything else gets [`HotkeyError::Unsupported`] so the caller can refuse to
/// run with a binding it cannot honour.
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::event::Trigger;

/// Virtual-key code of the bound key (0 = disabled). Read inside the hook callback.
static HOOK_VK: AtomicU32 = AtomicU32::new(0);
/// Required modifier bits (see [`Modifiers::bits`]).
static HOOK_MODS: AtomicU32 = AtomicU32::new(0);

/// Channel used to forward reload triggers from the hook callback to the
/// supervisor loop.  Set once by [`start`].
#[cfg_attr(not(any(windows, target_os = "macos")), allow(dead_code))]
static HOOK_TX: OnceLock<mpsc::Sender<Trigger>> = OnceLock::new();

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HotkeyError {
    #[error("hotkey combination is empty")]
    Empty,
    #[error("unrecognised key {0:?}")]
    UnknownKey(String),
    #[error("hotkey {0:?} has no non-modifier key")]
    MissingKey(String),
    #[error("hotkey {0:?} names more than one non-modifier key")]
    MultipleKeys(String),
    #[error("global hotkeys are not supported on this platform")]
    Unsupported,
    #[error("failed to install global hotkey: {0}")]
    Install(String),
}

/// Modifier keys that must be held for the hotkey to fire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Modifiers {
    pub ctrl: bool,
    pub alt: bool,
    pub shift: bool,
}

impl Modifiers {
    const CTRL: u32 = 0b001;
    const ALT: u32 = 0b010;
    const SHIFT: u32 = 0b100;

    pub fn bits(self) -> u32 {
        let mut bits = 0;
        if self.ctrl {
            bits |= Self::CTRL;
        }
        if self.alt {
            bits |= Self::ALT;
        }
        if self.shift {
            bits |= Self::SHIFT;
        }
        bits
    }
}

/// A parsed key combination such as `Alt+Shift+T`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hotkey {
    pub modifiers: Modifiers,
    /// Windows virtual-key code of the non-modifier key.
    pub vk: u32,
}

impl Hotkey {
    /// Parses a `+`-separated combination, case-insensitively.
    ///
    /// Each part may be wrapped in angle brackets (`<alt>+<shift>+t`).
    /// Modifiers: `Ctrl`/`Control`, `Alt`, `Shift`.  Exactly one other part
    /// must name a key accepted by [`parse_vk`].
    pub fn parse(combo: &str) -> Result<Self, HotkeyError> {
        if combo.trim().is_empty() {
            return Err(HotkeyError::Empty);
        }

        let mut modifiers = Modifiers::default();
        let mut vk = None;
        for part in combo.split('+') {
            let name = part.trim().trim_start_matches('<').trim_end_matches('>');
            match name.to_lowercase().as_str() {
                "ctrl" | "control" => modifiers.ctrl = true,
                "alt" => modifiers.alt = true,
                "shift" => modifiers.shift = true,
                _ => {
                    let code =
                        parse_vk(name).ok_or_else(|| HotkeyError::UnknownKey(name.to_string()))?;
                    if vk.replace(code).is_some() {
                        return Err(HotkeyError::MultipleKeys(combo.to_string()));
                    }
                }
            }
        }

        let vk = vk.ok_or_else(|| HotkeyError::MissingKey(combo.to_string()))?;
        Ok(Self { modifiers, vk })
    }
}

impl fmt::Display for Hotkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.modifiers.ctrl {
            f.write_str("Ctrl+")?;
        }
        if self.modifiers.alt {
            f.write_str("Alt+")?;
        }
        if self.modifiers.shift {
            f.write_str("Shift+")?;
        }
        match self.vk {
            0x70..=0x7B => write!(f, "F{}", self.vk - 0x6F),
            vk => match char::from_u32(vk) {
                Some(c) => write!(f, "{c}"),
                None => write!(f, "0x{vk:02X}"),
            },
        }
    }
}

/// Converts a key name (e.g. `"F8"`, `"T"`) to a Windows virtual-key code.
///
/// Supported keys:
/// - Function keys `F1`–`F12` (case-insensitive).
/// - ASCII letters `A`–`Z` (normalised to their uppercase VK values, `0x41`–`0x5A`).
/// - ASCII digits `0`–`9` (VK values `0x30`–`0x39`).
///
/// Returns `None` for any unrecognised name.
pub fn parse_vk(name: &str) -> Option<u32> {
    let upper = name.to_uppercase();
    if let Some(n) = upper.strip_prefix('F').and_then(|n| n.parse::<u32>().ok()) {
        return (1..=12).contains(&n).then_some(0x6F + n);
    }
    let mut chars = upper.chars();
    match (chars.next(), chars.next()) {
        // 'A'=0x41…'Z'=0x5A; '0'=0x30…'9'=0x39, exact match to Windows VK codes.
        (Some(c), None) if c.is_ascii_alphanumeric() => Some(c as u32),
        _ => None,
    }
}

// ── Public handle ─────────────────────────────────────────────────────────────

/// A handle to the running hotkey listener.
pub struct HotkeyHandle {
    #[cfg(windows)]
    thread: std::thread::JoinHandle<()>,
    /// Thread ID of the message-pump thread, used to post `WM_QUIT`.
    #[cfg(windows)]
    thread_id: u32,
    #[cfg(all(unix, not(target_os = "macos")))]
    grab: x11::Grab,
}

impl HotkeyHandle {
    /// Stops delivering hotkey presses.
    ///
    /// On Windows this blocks until the hook thread exits; on X11 the key grab
    /// is released.
    pub fn stop(self) {
        HOOK_VK.store(0, Ordering::Relaxed);
        #[cfg(windows)]
        {
            imp::post_quit(self.thread_id);
            let _ = self.thread.join();
        }
        #[cfg(all(unix, not(target_os = "macos")))]
        self.grab.release();
    }
}

// ── Startup ───────────────────────────────────────────────────────────────────

/// Registers `hotkey` with the platform backend and returns a [`HotkeyHandle`]
/// for managing it.
///
/// When `hotkey` is pressed, [`Trigger::Reload`] is sent to `tx` via a
/// non-blocking [`try_send`](mpsc::Sender::try_send).  If the channel is full
/// the press is dropped; a reload is already queued in that case.
pub fn start(hotkey: Hotkey, tx: mpsc::Sender<Trigger>) -> Result<HotkeyHandle, HotkeyError> {
    HOOK_VK.store(hotkey.vk, Ordering::Relaxed);
    HOOK_MODS.store(hotkey.modifiers.bits(), Ordering::Relaxed);

    #[cfg(windows)]
    {
        // Silently ignore if called more than once (e.g. in test binaries).
        let _ = HOOK_TX.set(tx);
        let (id_tx, id_rx) = std::sync::mpsc::sync_channel::<Result<u32, String>>(1);
        let thread = std::thread::Builder::new()
            .name("hotkey-pump".into())
            .spawn(move || imp::run_message_pump(id_tx))
            .map_err(|e| HotkeyError::Install(e.to_string()))?;
        let thread_id = id_rx
            .recv()
            .map_err(|_| HotkeyError::Install("hook thread exited during setup".into()))?
            .map_err(HotkeyError::Install)?;
        tracing::info!(%hotkey, "Reload hotkey registered");
        Ok(HotkeyHandle { thread, thread_id })
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    {
        let grab = x11::grab(hotkey, tx).inspect_err(|_| HOOK_VK.store(0, Ordering::Relaxed))?;
        tracing::info!(%hotkey, "Reload hotkey registered");
        Ok(HotkeyHandle { grab })
    }

    #[cfg(target_os = "macos")]
    {
        let _ = HOOK_TX.set(tx);
        tap::listen().inspect_err(|_| HOOK_VK.store(0, Ordering::Relaxed))?;
        tracing::info!(%hotkey, "Reload hotkey registered");
        Ok(HotkeyHandle {})
    }

    #[cfg(not(any(windows, unix)))]
    {
        drop(tx);
        HOOK_VK.store(0, Ordering::Relaxed);
        Err(HotkeyError::Unsupported)
    }
}

// ── Windows implementation ────────────────────────────────────────────────────

#[cfg(windows)]
mod imp {
    use std::sync::atomic::Ordering;
    use std::sync::mpsc as std_mpsc;

    use windows::Win32::Foundation::{HINSTANCE, LPARAM, LRESULT, WPARAM};
    use windows::Win32::System::Threading::GetCurrentThreadId;
    use windows::Win32::UI::Input::KeyboardAndMouse::{
        GetAsyncKeyState, VIRTUAL_KEY, VK_CONTROL, VK_MENU, VK_SHIFT,
    };
    use windows::Win32::UI::WindowsAndMessaging::{
        CallNextHookEx, DispatchMessageW, GetMessageW, PostThreadMessageW,
        SetWindowsHookExW, UnhookWindowsHookEx,
        KBDLLHOOKSTRUCT, MSG, WH_KEYBOARD_LL, WM_KEYDOWN, WM_QUIT, WM_SYSKEYDOWN,
    };

    use super::{Modifiers, HOOK_MODS, HOOK_TX, HOOK_VK};
    use crate::event::{ReloadSource, Trigger};

    fn is_down(key: VIRTUAL_KEY) -> bool {
        // High bit set = key currently held.
        unsafe { (GetAsyncKeyState(key.0 as i32) as u16) & 0x8000 != 0 }
    }

    fn held_modifiers() -> u32 {
        Modifiers {
            ctrl: is_down(VK_CONTROL),
            alt: is_down(VK_MENU),
            shift: is_down(VK_SHIFT),
        }
        .bits()
    }

    /// Low-level keyboard hook procedure.
    ///
    /// Called by Windows on every keyboard event system-wide.  Holding Alt turns
    /// key-downs into `WM_SYSKEYDOWN`, so both messages are checked.
    unsafe extern "system" fn keyboard_proc(
        n_code: i32,
        w_param: WPARAM,
        l_param: LPARAM,
    ) -> LRESULT {
        let msg = w_param.0 as u32;
        if n_code >= 0 && (msg == WM_KEYDOWN || msg == WM_SYSKEYDOWN) {
            let kb = &*(l_param.0 as *const KBDLLHOOKSTRUCT);
            let target = HOOK_VK.load(Ordering::Relaxed);
            if target != 0
                && kb.vkCode == target
                && held_modifiers() == HOOK_MODS.load(Ordering::Relaxed)
            {
                if let Some(tx) = HOOK_TX.get() {
                    let _ = tx.try_send(Trigger::Reload(ReloadSource::Hotkey));
                }
            }
        }
        CallNextHookEx(None, n_code, w_param, l_param)
    }

    /// Installs `WH_KEYBOARD_LL`, runs a Windows message pump until `WM_QUIT`,
    /// then uninstalls the hook.
    ///
    /// Reports the current thread ID (or the install error) to `id_tx` before
    /// entering the pump so that [`super::start`] can later post `WM_QUIT`.
    pub fn run_message_pump(id_tx: std_mpsc::SyncSender<Result<u32, String>>) {
        unsafe {
            let hook = match SetWindowsHookExW(
                WH_KEYBOARD_LL,
                Some(keyboard_proc),
                HINSTANCE::default(),
                0,
            ) {
                Ok(hook) => hook,
                Err(e) => {
                    let _ = id_tx.send(Err(e.to_string()));
                    return;
                }
            };
            let _ = id_tx.send(Ok(GetCurrentThreadId()));
            drop(id_tx);

            let mut msg = MSG::default();
            // GetMessageW: >0 = message, 0 = WM_QUIT, <0 = error.
            while GetMessageW(&mut msg, None, 0, 0).0 > 0 {
                DispatchMessageW(&msg);
            }

            let _ = UnhookWindowsHookEx(hook);
            tracing::debug!("Hotkey hook thread exited");
        }
    }

    /// Posts `WM_QUIT` to `thread_id`, causing its `GetMessageW` loop to exit.
    pub fn post_quit(thread_id: u32) {
        unsafe {
            let _ = PostThreadMessageW(thread_id, WM_QUIT, WPARAM(0), LPARAM(0));
        }
    }
}

// ── X11 implementation ────────────────────────────────────────────────────────

#[cfg(all(unix, not(target_os = "macos")))]
mod x11 {
    use global_hotkey::hotkey::{Code, HotKey, Modifiers as KeyModifiers};
    use global_hotkey::{GlobalHotKeyEvent, GlobalHotKeyManager, HotKeyState};
    use tokio::sync::mpsc;

    use super::{Hotkey, HotkeyError};
    use crate::event::{ReloadSource, Trigger};

    const LETTERS: [Code; 26] = [
        Code::KeyA, Code::KeyB, Code::KeyC, Code::KeyD, Code::KeyE, Code::KeyF,
        Code::KeyG, Code::KeyH, Code::KeyI, Code::KeyJ, Code::KeyK, Code::KeyL,
        Code::KeyM, Code::KeyN, Code::KeyO, Code::KeyP, Code::KeyQ, Code::KeyR,
        Code::KeyS, Code::KeyT, Code::KeyU, Code::KeyV, Code::KeyW, Code::KeyX,
        Code::KeyY, Code::KeyZ,
    ];
    const DIGITS: [Code; 10] = [
        Code::Digit0, Code::Digit1, Code::Digit2, Code::Digit3, Code::Digit4,
        Code::Digit5, Code::Digit6, Code::Digit7, Code::Digit8, Code::Digit9,
    ];
    const FUNCTION_KEYS: [Code; 12] = [
        Code::F1, Code::F2, Code::F3, Code::F4, Code::F5, Code::F6,
        Code::F7, Code::F8, Code::F9, Code::F10, Code::F11, Code::F12,
    ];

    /// An active key grab on the X server.
    pub struct Grab {
        manager: GlobalHotKeyManager,
        hotkey: HotKey,
    }

    impl Grab {
        pub fn release(self) {
            GlobalHotKeyEvent::set_event_handler(None::<fn(GlobalHotKeyEvent)>);
            if let Err(e) = self.manager.unregister(self.hotkey) {
                tracing::debug!("Failed to release hotkey grab: {e}");
            }
        }
    }

    /// Maps a virtual-key code from [`super::parse_vk`] to the physical key.
    pub(super) fn code_for(vk: u32) -> Option<Code> {
        match vk {
            0x41..=0x5A => Some(LETTERS[(vk - 0x41) as usize]),
            0x30..=0x39 => Some(DIGITS[(vk - 0x30) as usize]),
            0x70..=0x7B => Some(FUNCTION_KEYS[(vk - 0x70) as usize]),
            _ => None,
        }
    }

    pub(super) fn key_modifiers(hotkey: Hotkey) -> KeyModifiers {
        let mut mods = KeyModifiers::empty();
        if hotkey.modifiers.ctrl {
            mods |= KeyModifiers::CONTROL;
        }
        if hotkey.modifiers.alt {
            mods |= KeyModifiers::ALT;
        }
        if hotkey.modifiers.shift {
            mods |= KeyModifiers::SHIFT;
        }
        mods
    }

    pub fn grab(hotkey: Hotkey, tx: mpsc::Sender<Trigger>) -> Result<Grab, HotkeyError> {
        // The X11 event thread inside global-hotkey assumes a display opens.
        if std::env::var_os("DISPLAY").map_or(true, |d| d.is_empty()) {
            return Err(HotkeyError::Install("no X11 display (DISPLAY is not set)".into()));
        }
        let code = code_for(hotkey.vk).ok_or_else(|| HotkeyError::UnknownKey(hotkey.to_string()))?;
        let binding = HotKey::new(Some(key_modifiers(hotkey)), code);

        let manager = GlobalHotKeyManager::new().map_err(|e| HotkeyError::Install(e.to_string()))?;
        manager
            .register(binding)
            .map_err(|e| HotkeyError::Install(e.to_string()))?;

        let id = binding.id();
        GlobalHotKeyEvent::set_event_handler(Some(move |event: GlobalHotKeyEvent| {
            if event.id == id && event.state == HotKeyState::Pressed {
                let _ = tx.try_send(Trigger::Reload(ReloadSource::Hotkey));
            }
        }));
        Ok(Grab {
            manager,
            hotkey: binding,
        })
    }
}

// ── macOS implementation ──────────────────────────────────────────────────────

#[cfg(target_os = "macos")]
mod tap {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    use rdev::{EventType, Key};

    use super::{HotkeyError, Modifiers, HOOK_MODS, HOOK_TX, HOOK_VK};
    use crate::event::{ReloadSource, Trigger};

    /// Modifier bits currently held, tracked from the tap's own events.
    static HELD: AtomicU32 = AtomicU32::new(0);

    /// `rdev::listen` only returns on failure; silence this long means the tap
    /// is installed.
    const SETUP_WINDOW: Duration = Duration::from_millis(250);

    const LETTERS: [Key; 26] = [
        Key::KeyA, Key::KeyB, Key::KeyC, Key::KeyD, Key::KeyE, Key::KeyF,
        Key::KeyG, Key::KeyH, Key::KeyI, Key::KeyJ, Key::KeyK, Key::KeyL,
        Key::KeyM, Key::KeyN, Key::KeyO, Key::KeyP, Key::KeyQ, Key::KeyR,
        Key::KeyS, Key::KeyT, Key::KeyU, Key::KeyV, Key::KeyW, Key::KeyX,
        Key::KeyY, Key::KeyZ,
    ];
    const DIGITS: [Key; 10] = [
        Key::Num0, Key::Num1, Key::Num2, Key::Num3, Key::Num4,
        Key::Num5, Key::Num6, Key::Num7, Key::Num8, Key::Num9,
    ];
    const FUNCTION_KEYS: [Key; 12] = [
        Key::F1, Key::F2, Key::F3, Key::F4, Key::F5, Key::F6,
        Key::F7, Key::F8, Key::F9, Key::F10, Key::F11, Key::F12,
    ];

    pub(super) fn modifier_bit(key: Key) -> Option<u32> {
        match key {
            Key::ControlLeft | Key::ControlRight => Some(Modifiers::CTRL),
            Key::Alt | Key::AltGr => Some(Modifiers::ALT),
            Key::ShiftLeft | Key::ShiftRight => Some(Modifiers::SHIFT),
            _ => None,
        }
    }

    /// Inverse of [`super::parse_vk`] for the keys the tap reports.
    pub(super) fn vk_for(key: Key) -> Option<u32> {
        let index = |table: &[Key]| table.iter().position(|&k| k == key).map(|i| i as u32);
        index(&LETTERS)
            .map(|i| 0x41 + i)
            .or_else(|| index(&DIGITS).map(|i| 0x30 + i))
            .or_else(|| index(&FUNCTION_KEYS).map(|i| 0x70 + i))
    }

    fn on_event(event: &EventType) {
        match *event {
            EventType::KeyPress(key) => {
                if let Some(bit) = modifier_bit(key) {
                    HELD.fetch_or(bit, Ordering::Relaxed);
                    return;
                }
                let target = HOOK_VK.load(Ordering::Relaxed);
                if target != 0
                    && vk_for(key) == Some(target)
                    && HELD.load(Ordering::Relaxed) == HOOK_MODS.load(Ordering::Relaxed)
                {
                    if let Some(tx) = HOOK_TX.get() {
                        let _ = tx.try_send(Trigger::Reload(ReloadSource::Hotkey));
                    }
                }
            }
            EventType::KeyRelease(key) => {
                if let Some(bit) = modifier_bit(key) {
                    HELD.fetch_and(!bit, Ordering::Relaxed);
                }
            }
            _ => {}
        }
    }

    /// Starts the event tap on a detached listener thread.
    pub fn listen() -> Result<(), HotkeyError> {
        let (err_tx, err_rx) = std_mpsc::sync_channel::<String>(1);
        std::thread::Builder::new()
            .name("hotkey-listen".into())
            .spawn(move || {
                if let Err(e) = rdev::listen(|event: rdev::Event| on_event(&event.event_type)) {
                    let _ = err_tx.send(format!("{e:?}"));
                }
            })
            .map_err(|e| HotkeyError::Install(e.to_string()))?;

        match err_rx.recv_timeout(SETUP_WINDOW) {
            Ok(reason) => Err(HotkeyError::Install(reason)),
            Err(std_mpsc::RecvTimeoutError::Timeout) => Ok(()),
            Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                Err(HotkeyError::Install("event tap exited during setup".into()))
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
