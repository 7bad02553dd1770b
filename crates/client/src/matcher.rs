//! Device discovery
//!
//! Polls the platform's device registry for a vendor/product pair until one
//! of the present devices can be fully claimed. A device that is missing,
//! held by another client or fails any claiming step only costs another scan
//! after the retry interval.

use crate::claimer::{Connection, close_device, open_device, open_interface};
use crate::platform::UsbPlatform;
use common::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Delay between two discovery scans
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// Cancels a pending discovery loop from another thread
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Discovery loop parameters
///
/// With neither a timeout nor a cancel token the loop polls until a device
/// shows up. The timeout is a budget per discovery run, so options kept by
/// a session give every later connect the full budget again.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub retry_interval: Duration,
    pub timeout: Option<Duration>,
    pub cancel: Option<CancelToken>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            retry_interval: DEFAULT_RETRY_INTERVAL,
            timeout: None,
            cancel: None,
        }
    }
}

impl ConnectOptions {
    /// Give up once a discovery run has taken `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }
}

/// Find a matching device and claim interface `index` on it
///
/// Blocks until a device is claimed, the deadline passes or the token is
/// cancelled.
pub fn find_and_claim<P: UsbPlatform>(
    platform: &P,
    vendor_id: u16,
    product_id: u16,
    index: u8,
    alt_setting: u8,
    options: &ConnectOptions,
) -> Result<Connection<P>> {
    let deadline = options.timeout.map(|timeout| Instant::now() + timeout);
    let mut scans: u64 = 0;

    loop {
        if options.is_cancelled() {
            info!("Discovery of {:04x}:{:04x} cancelled", vendor_id, product_id);
            return Err(Error::Cancelled);
        }

        scans += 1;
        if let Some(connection) = scan(platform, vendor_id, product_id, index, alt_setting) {
            debug!("Device claimed after {} scan(s)", scans);
            return Ok(connection);
        }

        let mut pause = options.retry_interval;
        if let Some(deadline) = deadline {
            let now = Instant::now();
            if now >= deadline {
                info!(
                    "No claimable {:04x}:{:04x} device after {} scan(s)",
                    vendor_id, product_id, scans
                );
                return Err(Error::DeadlineExceeded);
            }
            pause = pause.min(deadline - now);
        }

        std::thread::sleep(pause);
    }
}

/// One query-and-scan cycle over every present candidate
fn scan<P: UsbPlatform>(
    platform: &P,
    vendor_id: u16,
    product_id: u16,
    index: u8,
    alt_setting: u8,
) -> Option<Connection<P>> {
    let candidates = match platform.find_devices(vendor_id, product_id) {
        Ok(candidates) => candidates,
        Err(e) => {
            debug!("Device registry query failed: {}", e);
            return None;
        }
    };

    if candidates.is_empty() {
        debug!("No {:04x}:{:04x} device present", vendor_id, product_id);
        return None;
    }

    // Returning early drops the unvisited candidates, releasing them
    for (position, candidate) in candidates.into_iter().enumerate() {
        let mut device = match open_device(platform, candidate) {
            Ok(device) => device,
            Err(e) => {
                log_rejection(position, &e);
                continue;
            }
        };

        match open_interface(platform, &mut device.handle, index, alt_setting) {
            Ok(interface) => return Some(Connection { device, interface }),
            Err(e) => {
                log_rejection(position, &e);
                close_device(platform, device);
            }
        }
    }

    None
}

fn log_rejection(position: usize, error: &Error) {
    if error.is_retriable() {
        debug!("Skipping candidate {}: {}", position, error);
    } else {
        warn!("Skipping candidate {}: {}", position, error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claimer::close_connection;
    use crate::test_utils::{Call, ClaimStep, MockDevice, MockPlatform};

    fn fast() -> ConnectOptions {
        ConnectOptions::default().with_retry_interval(Duration::from_millis(1))
    }

    #[test]
    fn test_first_claimable_candidate_wins() {
        let platform = MockPlatform::new().with_devices(vec![
            MockDevice::new(1).failing_at(ClaimStep::Seize),
            MockDevice::new(2).failing_at(ClaimStep::SeizeInterface),
            MockDevice::new(3),
            MockDevice::new(4),
        ]);

        let connection = find_and_claim(&platform, 0x1234, 0x5678, 0, 0, &fast()).unwrap();

        // Candidate 2 was opened and then given back; 4 was never touched
        assert!(platform.calls().contains(&Call::ReleaseDevice(2)));
        assert!(!platform.calls().contains(&Call::SeizeDevice(4)));
        assert_eq!(platform.outstanding_devices(), 1);
        assert_eq!(platform.scan_count(), 1);

        close_connection(&platform, connection);
        assert_eq!(platform.outstanding_devices(), 0);
    }

    #[test]
    fn test_deadline_exceeded() {
        let platform = MockPlatform::new();
        let options = fast().with_timeout(Duration::from_millis(20));

        let started = Instant::now();
        let result = find_and_claim(&platform, 0x1234, 0x5678, 0, 0, &options);
        assert!(matches!(result, Err(Error::DeadlineExceeded)));
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert!(platform.scan_count() >= 2);
    }

    #[test]
    fn test_cancelled_before_first_scan() {
        let platform = MockPlatform::new().with_devices(vec![MockDevice::new(1)]);
        let token = CancelToken::new();
        token.cancel();

        let result = find_and_claim(&platform, 0x1234, 0x5678, 0, 0, &fast().with_cancel(token));
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(platform.scan_count(), 0);
    }

    #[test]
    fn test_registry_failure_is_retried() {
        let platform = MockPlatform::new()
            .with_scans(vec![vec![], vec![MockDevice::new(1)]])
            .failing_registry_queries(1);

        let connection = find_and_claim(&platform, 0x1234, 0x5678, 0, 0, &fast()).unwrap();
        assert_eq!(platform.scan_count(), 2);
        close_connection(&platform, connection);
    }
}
