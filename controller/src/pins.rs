use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex as StdMutex},
};

use blinds_common::PinLayout;
use thiserror::Error;
use tokio::{
    sync::{Mutex, MutexGuard},
    time::Instant,
};
use tracing::{info, warn};

const JOURNAL_CAPACITY: usize = 4_096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("{backend} backend not compiled into this build")]
    NotCompiled { backend: &'static str },
    #[error("{backend} init failed: {reason}")]
    Init {
        backend: &'static str,
        reason: String,
    },
    #[error("{backend} pin {pin}: {reason}")]
    Pin {
        backend: &'static str,
        pin: u8,
        reason: String,
    },
}

/// Raw pin access. Implementations do no locking of their own beyond what
/// they need for interior mutability; callers serialize through [`PinBus`].
pub trait PinDriver: Send + Sync {
    fn backend(&self) -> &'static str;
    fn set_output_low(&self, pin: u8) -> Result<(), HardwareError>;
    fn set_output_high(&self, pin: u8) -> Result<(), HardwareError>;
    fn set_input_pull_up(&self, pin: u8) -> Result<(), HardwareError>;
    fn read(&self, pin: u8) -> Result<Level, HardwareError>;
}

/// Tries each compiled-in backend in preference order and never fails:
/// the simulated driver is the last resort.
pub fn select_driver(layout: &PinLayout) -> Arc<dyn PinDriver> {
    type Opener = fn(&PinLayout) -> Result<Arc<dyn PinDriver>, HardwareError>;
    let backends: [(&str, Opener); 3] = [
        ("rppal", open_rppal),
        ("gpio-cdev", open_cdev),
        ("sysfs", open_sysfs),
    ];

    for (name, open) in backends {
        match open(layout) {
            Ok(driver) => {
                info!("pin driver selected: {name}");
                return driver;
            }
            Err(err) => warn!("pin driver {name} unavailable: {err}"),
        }
    }

    warn!("no GPIO backend available, falling back to simulated pins");
    Arc::new(SimulatedDriver::new())
}

#[cfg(feature = "rppal")]
fn open_rppal(layout: &PinLayout) -> Result<Arc<dyn PinDriver>, HardwareError> {
    Ok(Arc::new(rppal_backend::RppalDriver::open(layout)?))
}

#[cfg(not(feature = "rppal"))]
fn open_rppal(_layout: &PinLayout) -> Result<Arc<dyn PinDriver>, HardwareError> {
    Err(HardwareError::NotCompiled { backend: "rppal" })
}

#[cfg(feature = "cdev")]
fn open_cdev(layout: &PinLayout) -> Result<Arc<dyn PinDriver>, HardwareError> {
    Ok(Arc::new(cdev_backend::CdevDriver::open(layout)?))
}

#[cfg(not(feature = "cdev"))]
fn open_cdev(_layout: &PinLayout) -> Result<Arc<dyn PinDriver>, HardwareError> {
    Err(HardwareError::NotCompiled {
        backend: "gpio-cdev",
    })
}

#[cfg(feature = "sysfs")]
fn open_sysfs(layout: &PinLayout) -> Result<Arc<dyn PinDriver>, HardwareError> {
    Ok(Arc::new(sysfs_backend::SysfsDriver::open(layout)?))
}

#[cfg(not(feature = "sysfs"))]
fn open_sysfs(_layout: &PinLayout) -> Result<Arc<dyn PinDriver>, HardwareError> {
    Err(HardwareError::NotCompiled { backend: "sysfs" })
}

/// The process-wide pin handle. Direction changes are only reachable through
/// a [`PinGuard`], so at most one task reconfigures pins at any moment.
#[derive(Clone)]
pub struct PinBus {
    driver: Arc<dyn PinDriver>,
    lock: Arc<Mutex<()>>,
}

pub struct PinGuard<'a> {
    driver: &'a dyn PinDriver,
    _held: MutexGuard<'a, ()>,
}

impl PinBus {
    pub fn new(driver: Arc<dyn PinDriver>) -> Self {
        Self {
            driver,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn backend(&self) -> &'static str {
        self.driver.backend()
    }

    pub async fn lock(&self) -> PinGuard<'_> {
        PinGuard {
            driver: self.driver.as_ref(),
            _held: self.lock.lock().await,
        }
    }

    /// Level reads do not change direction and skip the bus lock.
    pub fn read(&self, pin: u8) -> Result<Level, HardwareError> {
        self.driver.read(pin)
    }
}

impl PinGuard<'_> {
    pub fn drive_low(&self, pin: u8) -> Result<(), HardwareError> {
        self.driver.set_output_low(pin)
    }

    pub fn drive_high(&self, pin: u8) -> Result<(), HardwareError> {
        self.driver.set_output_high(pin)
    }

    pub fn release(&self, pin: u8) -> Result<(), HardwareError> {
        self.driver.set_input_pull_up(pin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    OutputLow,
    OutputHigh,
    InputPullUp,
}

/// Journal entry; read back through `SimulatedDriver::journal` in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(not(test), allow(dead_code))]
pub struct PinEvent {
    pub at: Instant,
    pub pin: u8,
    pub mode: PinMode,
}

#[derive(Debug, Default)]
struct SimulatedPins {
    modes: HashMap<u8, PinMode>,
    forced: HashMap<u8, Level>,
    journal: VecDeque<PinEvent>,
}

/// Hardware-free driver: reads return the last commanded level, and every
/// direction change is journaled with the (tokio) time it happened.
#[derive(Debug, Clone, Default)]
pub struct SimulatedDriver {
    pins: Arc<StdMutex<SimulatedPins>>,
}

impl SimulatedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn pins(&self) -> std::sync::MutexGuard<'_, SimulatedPins> {
        self.pins
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn command(&self, pin: u8, mode: PinMode) {
        let mut pins = self.pins();
        pins.forced.remove(&pin);
        pins.modes.insert(pin, mode);
        if pins.journal.len() >= JOURNAL_CAPACITY {
            pins.journal.pop_front();
        }
        pins.journal.push_back(PinEvent {
            at: Instant::now(),
            pin,
            mode,
        });
    }

    /// Makes `pin` read as `level` until the next command on it, the way an
    /// external switch or a fault would.
    #[cfg(test)]
    pub fn force_level(&self, pin: u8, level: Level) {
        self.pins().forced.insert(pin, level);
    }

    #[cfg(test)]
    pub fn journal(&self) -> Vec<PinEvent> {
        self.pins().journal.iter().copied().collect()
    }

    #[cfg(test)]
    pub fn mode(&self, pin: u8) -> Option<PinMode> {
        self.pins().modes.get(&pin).copied()
    }
}

impl PinDriver for SimulatedDriver {
    fn backend(&self) -> &'static str {
        "simulated"
    }

    fn set_output_low(&self, pin: u8) -> Result<(), HardwareError> {
        self.command(pin, PinMode::OutputLow);
        Ok(())
    }

    fn set_output_high(&self, pin: u8) -> Result<(), HardwareError> {
        self.command(pin, PinMode::OutputHigh);
        Ok(())
    }

    fn set_input_pull_up(&self, pin: u8) -> Result<(), HardwareError> {
        self.command(pin, PinMode::InputPullUp);
        Ok(())
    }

    fn read(&self, pin: u8) -> Result<Level, HardwareError> {
        let pins = self.pins();
        if let Some(level) = pins.forced.get(&pin) {
            return Ok(*level);
        }
        Ok(match pins.modes.get(&pin) {
            Some(PinMode::OutputHigh | PinMode::InputPullUp) => Level::High,
            Some(PinMode::OutputLow) | None => Level::Low,
        })
    }
}

#[cfg(feature = "rppal")]
mod rppal_backend {
    use std::{collections::HashMap, sync::Mutex};

    use blinds_common::PinLayout;
    use rppal::gpio::{Gpio, IoPin, Level as RppalLevel, Mode, PullUpDown};

    use super::{HardwareError, Level, PinDriver};

    const BACKEND: &str = "rppal";

    pub struct RppalDriver {
        pins: Mutex<HashMap<u8, IoPin>>,
    }

    impl RppalDriver {
        pub fn open(layout: &PinLayout) -> Result<Self, HardwareError> {
            let gpio = Gpio::new().map_err(|err| HardwareError::Init {
                backend: BACKEND,
                reason: err.to_string(),
            })?;

            let mut pins = HashMap::new();
            for pin in layout.all_pins() {
                let mut io = gpio
                    .get(pin)
                    .map_err(|err| HardwareError::Init {
                        backend: BACKEND,
                        reason: format!("pin {pin}: {err}"),
                    })?
                    .into_io(Mode::Input);
                // Shutdown decides the final pin state, not the drop order.
                io.set_reset_on_drop(false);
                pins.insert(pin, io);
            }

            Ok(Self {
                pins: Mutex::new(pins),
            })
        }

        fn with_pin<T>(
            &self,
            pin: u8,
            apply: impl FnOnce(&mut IoPin) -> T,
        ) -> Result<T, HardwareError> {
            let mut pins = self
                .pins
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let io = pins.get_mut(&pin).ok_or_else(|| HardwareError::Pin {
                backend: BACKEND,
                pin,
                reason: "not claimed at startup".to_string(),
            })?;
            Ok(apply(io))
        }
    }

    impl PinDriver for RppalDriver {
        fn backend(&self) -> &'static str {
            BACKEND
        }

        fn set_output_low(&self, pin: u8) -> Result<(), HardwareError> {
            self.with_pin(pin, |io| {
                io.set_low();
                io.set_mode(Mode::Output);
            })
        }

        fn set_output_high(&self, pin: u8) -> Result<(), HardwareError> {
            self.with_pin(pin, |io| {
                io.set_high();
                io.set_mode(Mode::Output);
            })
        }

        fn set_input_pull_up(&self, pin: u8) -> Result<(), HardwareError> {
            self.with_pin(pin, |io| {
                io.set_mode(Mode::Input);
                io.set_pullupdown(PullUpDown::PullUp);
            })
        }

        fn read(&self, pin: u8) -> Result<Level, HardwareError> {
            self.with_pin(pin, |io| match io.read() {
                RppalLevel::High => Level::High,
                RppalLevel::Low => Level::Low,
            })
        }
    }
}

#[cfg(feature = "cdev")]
mod cdev_backend {
    use std::{collections::HashMap, sync::Mutex};

    use blinds_common::PinLayout;
    use gpio_cdev::{Chip, LineHandle, LineRequestFlags};

    use super::{HardwareError, Level, PinDriver};

    const BACKEND: &str = "gpio-cdev";
    const CHIP_PATH: &str = "/dev/gpiochip0";
    const CONSUMER: &str = "blinds-controller";

    struct Lines {
        chip: Chip,
        handles: HashMap<u8, LineHandle>,
    }

    /// Character-device backend. The v1 line ABI has no bias flags, so
    /// "pull-up input" relies on the board's external pull-ups.
    pub struct CdevDriver {
        lines: Mutex<Lines>,
    }

    impl CdevDriver {
        pub fn open(layout: &PinLayout) -> Result<Self, HardwareError> {
            let chip = Chip::new(CHIP_PATH).map_err(|err| HardwareError::Init {
                backend: BACKEND,
                reason: format!("{CHIP_PATH}: {err}"),
            })?;
            let driver = Self {
                lines: Mutex::new(Lines {
                    chip,
                    handles: HashMap::new(),
                }),
            };
            for pin in layout.all_pins() {
                driver
                    .request(pin, LineRequestFlags::INPUT, 0)
                    .map_err(|err| HardwareError::Init {
                        backend: BACKEND,
                        reason: err.to_string(),
                    })?;
            }
            Ok(driver)
        }

        fn pin_error(pin: u8, err: gpio_cdev::Error) -> HardwareError {
            HardwareError::Pin {
                backend: BACKEND,
                pin,
                reason: err.to_string(),
            }
        }

        /// A line's direction is fixed per request, so re-request it.
        fn request(&self, pin: u8, flags: LineRequestFlags, value: u8) -> Result<(), HardwareError> {
            let mut lines = self
                .lines
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            lines.handles.remove(&pin);
            let handle = lines
                .chip
                .get_line(u32::from(pin))
                .and_then(|line| line.request(flags, value, CONSUMER))
                .map_err(|err| Self::pin_error(pin, err))?;
            lines.handles.insert(pin, handle);
            Ok(())
        }
    }

    impl PinDriver for CdevDriver {
        fn backend(&self) -> &'static str {
            BACKEND
        }

        fn set_output_low(&self, pin: u8) -> Result<(), HardwareError> {
            self.request(pin, LineRequestFlags::OUTPUT, 0)
        }

        fn set_output_high(&self, pin: u8) -> Result<(), HardwareError> {
            self.request(pin, LineRequestFlags::OUTPUT, 1)
        }

        fn set_input_pull_up(&self, pin: u8) -> Result<(), HardwareError> {
            self.request(pin, LineRequestFlags::INPUT, 0)
        }

        fn read(&self, pin: u8) -> Result<Level, HardwareError> {
            let lines = self
                .lines
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let handle = lines.handles.get(&pin).ok_or_else(|| HardwareError::Pin {
                backend: BACKEND,
                pin,
                reason: "line not requested".to_string(),
            })?;
            let value = handle
                .get_value()
                .map_err(|err| Self::pin_error(pin, err))?;
            Ok(if value == 0 { Level::Low } else { Level::High })
        }
    }
}

#[cfg(feature = "sysfs")]
mod sysfs_backend {
    use blinds_common::PinLayout;
    use sysfs_gpio::{Direction, Pin};

    use super::{HardwareError, Level, PinDriver};

    const BACKEND: &str = "sysfs";

    /// Legacy `/sys/class/gpio` backend; like gpio-cdev it cannot set bias.
    pub struct SysfsDriver;

    impl SysfsDriver {
        pub fn open(layout: &PinLayout) -> Result<Self, HardwareError> {
            for pin in layout.all_pins() {
                let sysfs_pin = Pin::new(u64::from(pin));
                sysfs_pin
                    .export()
                    .and_then(|()| sysfs_pin.set_direction(Direction::In))
                    .map_err(|err| HardwareError::Init {
                        backend: BACKEND,
                        reason: format!("pin {pin}: {err}"),
                    })?;
            }
            Ok(Self)
        }

        fn set_direction(pin: u8, direction: Direction) -> Result<(), HardwareError> {
            Pin::new(u64::from(pin))
                .set_direction(direction)
                .map_err(|err| HardwareError::Pin {
                    backend: BACKEND,
                    pin,
                    reason: err.to_string(),
                })
        }
    }

    impl PinDriver for SysfsDriver {
        fn backend(&self) -> &'static str {
            BACKEND
        }

        fn set_output_low(&self, pin: u8) -> Result<(), HardwareError> {
            Self::set_direction(pin, Direction::Low)
        }

        fn set_output_high(&self, pin: u8) -> Result<(), HardwareError> {
            Self::set_direction(pin, Direction::High)
        }

        fn set_input_pull_up(&self, pin: u8) -> Result<(), HardwareError> {
            Self::set_direction(pin, Direction::In)
        }

        fn read(&self, pin: u8) -> Result<Level, HardwareError> {
            let value = Pin::new(u64::from(pin))
                .get_value()
                .map_err(|err| HardwareError::Pin {
                    backend: BACKEND,
                    pin,
                    reason: err.to_string(),
                })?;
            Ok(if value == 0 { Level::Low } else { Level::High })
        }
    }
}
