//! Shared helpers for unit tests: work directories and synthetic oracles
//! with closed-form device laws.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, Once};
use std::thread::{self, ThreadId};

use arcstr::ArcStr;
use num_complex::Complex64;

use crate::oracle::{
    EvalError, EvalResult, Oracle, Params, Polarity, Probe, Quantity, Response, Spectrum,
    TransferKind,
};

pub(crate) const BUILD_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/build");

pub(crate) fn test_work_dir(name: &str) -> PathBuf {
    PathBuf::from(BUILD_PATH).join(name)
}

struct CaptureLogger {
    records: Mutex<Vec<(ThreadId, String)>>,
}

impl log::Log for CaptureLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::Level::Info
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            self.records
                .lock()
                .unwrap()
                .push((thread::current().id(), record.args().to_string()));
        }
    }

    fn flush(&self) {}
}

static LOGGER: CaptureLogger = CaptureLogger {
    records: Mutex::new(Vec::new()),
};
static LOGGER_INIT: Once = Once::new();

/// Runs `f` and returns the `info` and higher messages it logged on the
/// current thread.
pub(crate) fn capture_info_logs<T>(f: impl FnOnce() -> T) -> (T, Vec<String>) {
    LOGGER_INIT.call_once(|| {
        log::set_logger(&LOGGER).expect("failed to install test logger");
        log::set_max_level(log::LevelFilter::Info);
    });
    let id = thread::current().id();
    let start = LOGGER.records.lock().unwrap().len();
    let out = f();
    let logs = LOGGER.records.lock().unwrap()[start..]
        .iter()
        .filter(|(thread, _)| *thread == id)
        .map(|(_, msg)| msg.clone())
        .collect();
    (out, logs)
}

/// A device with `gm = k·sqrt(W·I)`, `ro = va / I`, `ciss = cw·W` and
/// `IC = I / (i0·W)`.
#[derive(Debug, Clone)]
pub(crate) struct SqrtDevice {
    pub width: ArcStr,
    pub current: ArcStr,
    pub polarity: Polarity,
    pub k: f64,
    pub va: f64,
    pub cw: f64,
    pub i0: f64,
    pub ic_crit: f64,
}

impl SqrtDevice {
    pub(crate) fn new(width: &str, current: &str, polarity: Polarity, k: f64) -> Self {
        Self {
            width: ArcStr::from(width),
            current: ArcStr::from(current),
            polarity,
            k,
            va: 10.0,
            cw: 1e-9,
            i0: 1e-6,
            ic_crit: f64::INFINITY,
        }
    }

    fn scalar(&self, params: &Params, device: &str, quantity: Quantity) -> EvalResult<f64> {
        if quantity == Quantity::IcCrit {
            return Ok(self.ic_crit);
        }
        let w = params
            .get(&self.width)
            .ok_or_else(|| EvalError::UnknownParam(self.width.clone()))?;
        let i = params
            .get(&self.current)
            .ok_or_else(|| EvalError::UnknownParam(self.current.clone()))?
            * self.polarity.sign();
        if !(w > 0.0) || !(i > 0.0) {
            return Err(EvalError::OperatingPoint {
                device: ArcStr::from(device),
                reason: format!("W={w:e} I={i:e}"),
            });
        }
        Ok(match quantity {
            Quantity::Gm => self.k * (w * i).sqrt(),
            Quantity::Go => i / self.va,
            Quantity::Ro => self.va / i,
            Quantity::Ciss => self.cw * w,
            Quantity::Ic => i / (self.i0 * w),
            Quantity::IcCrit => self.ic_crit,
        })
    }
}

type NoiseModel = Box<dyn Fn(&Params) -> EvalResult<Spectrum> + Send + Sync>;

/// An oracle backed by [`SqrtDevice`]s and a caller-supplied noise model.
///
/// The loop gain is a single pole `-gm·ro / (1 + s·ro·ciss)` of the first
/// registered input device.
pub(crate) struct SyntheticOracle {
    pub devices: BTreeMap<ArcStr, SqrtDevice>,
    pub input: ArcStr,
    noise: NoiseModel,
    evaluations: AtomicUsize,
}

impl SyntheticOracle {
    pub(crate) fn new(
        input: &str,
        devices: impl IntoIterator<Item = (&'static str, SqrtDevice)>,
        noise: impl Fn(&Params) -> EvalResult<Spectrum> + Send + Sync + 'static,
    ) -> Self {
        Self {
            devices: devices
                .into_iter()
                .map(|(name, dev)| (ArcStr::from(name), dev))
                .collect(),
            input: ArcStr::from(input),
            noise: Box::new(noise),
            evaluations: AtomicUsize::new(0),
        }
    }

    /// Number of noise evaluations performed so far.
    pub(crate) fn noise_evaluations(&self) -> usize {
        self.evaluations.load(Ordering::Relaxed)
    }
}

impl Oracle for SyntheticOracle {
    fn device_scalar(&self, params: &Params, device: &str, quantity: Quantity) -> EvalResult<f64> {
        self.devices
            .get(device)
            .ok_or_else(|| EvalError::UnknownDevice(ArcStr::from(device)))?
            .scalar(params, device, quantity)
    }

    fn input_noise(&self, params: &Params, _probe: &Probe) -> EvalResult<Spectrum> {
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        (self.noise)(params)
    }

    fn transfer(&self, params: &Params, _probe: &Probe, kind: TransferKind) -> EvalResult<Response> {
        let gm = self.device_scalar(params, &self.input, Quantity::Gm)?;
        let ro = self.device_scalar(params, &self.input, Quantity::Ro)?;
        let c = self.device_scalar(params, &self.input, Quantity::Ciss)?;
        let l = move |s: Complex64| -gm * ro / (1.0 + s * ro * c);
        let response: Response = match kind {
            TransferKind::LoopGain => Box::new(l),
            TransferKind::Servo | TransferKind::Gain => Box::new(move |s: Complex64| {
                let l = l(s);
                -l / (1.0 - l)
            }),
            TransferKind::AsymptoticGain => Box::new(|_: Complex64| Complex64::new(1.0, 0.0)),
            TransferKind::Direct => Box::new(|_: Complex64| Complex64::new(0.0, 0.0)),
        };
        Ok(response)
    }
}

/// The device set used by the stage searches in tests:
///
/// * `X1`/`X1C`: input device and cascode sharing `ID1_N`;
/// * `X4`: follower (`W2_N`/`ID2_N`);
/// * `X2`/`X3`: push (PMOS, `W_P`/`ID_P`) and pull (NMOS, `W_N`/`ID_N`).
pub(crate) fn amplifier_devices(k_input: f64) -> Vec<(&'static str, SqrtDevice)> {
    vec![
        ("X1", SqrtDevice::new("W1_N", "ID1_N", Polarity::N, k_input)),
        ("X1C", SqrtDevice::new("W1C_N", "ID1_N", Polarity::N, 0.2)),
        ("X4", SqrtDevice::new("W2_N", "ID2_N", Polarity::N, 0.2)),
        ("X2", SqrtDevice::new("W_P", "ID_P", Polarity::P, 0.1)),
        ("X3", SqrtDevice::new("W_N", "ID_N", Polarity::N, 0.3)),
    ]
}

pub(crate) fn amplifier_params() -> Params {
    [
        ("W1_N", 10e-6),
        ("ID1_N", 1e-3),
        ("W1C_N", 10e-6),
        ("W2_N", 20e-6),
        ("ID2_N", 2e-3),
        ("W_N", 100e-6),
        ("ID_N", 5e-3),
        ("W_P", 300e-6),
        ("ID_P", -5e-3),
    ]
    .into_iter()
    .collect()
}

/// White input noise `a / I_D1` with no frequency dependence.
pub(crate) fn inverse_current_noise(
    a: f64,
) -> impl Fn(&Params) -> EvalResult<Spectrum> + Send + Sync + 'static {
    move |params: &Params| {
        let i = params
            .get("ID1_N")
            .ok_or_else(|| EvalError::UnknownParam(arcstr::literal!("ID1_N")))?;
        Ok(Box::new(move |_f: f64| a / i) as Spectrum)
    }
}
