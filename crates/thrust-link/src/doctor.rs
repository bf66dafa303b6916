use anyhow::Result;
use thrust_proto::Calibration;

use crate::LinkConfig;

pub fn check_link(cfg: &LinkConfig) -> Result<()> {
    if let Some(dev) = &cfg.serial_dev {
        anyhow::ensure!(!dev.is_empty(), "link.serial_dev is empty");
    }
    anyhow::ensure!(cfg.baud() > 0, "link.baud invalid");
    anyhow::ensure!(!cfg.read_timeout().is_zero(), "link.read_timeout_ms must be > 0");
    anyhow::ensure!(!cfg.write_timeout().is_zero(), "link.write_timeout_ms must be > 0");
    let base = cfg.backoff_base_ms.unwrap_or(50);
    let max = cfg.backoff_max_ms.unwrap_or(2000);
    anyhow::ensure!(base > 0, "link.backoff_base_ms must be > 0");
    anyhow::ensure!(max >= base, "link.backoff_max_ms must be >= backoff_base_ms");
    Ok(())
}

pub fn check_calibration(cal: &Calibration) -> Result<()> {
    anyhow::ensure!(cal.is_valid(), "calibration values must be finite and raw_at_weight non-zero");
    anyhow::ensure!(cal.weight_grams > 0.0, "calibration.weight_grams must be > 0");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass() {
        check_link(&LinkConfig::default()).unwrap();
        check_calibration(&Calibration::default()).unwrap();
    }

    #[test]
    fn bad_values_fail() {
        let cfg = LinkConfig { read_timeout_ms: Some(0), ..Default::default() };
        assert!(check_link(&cfg).is_err());
        let cfg = LinkConfig { backoff_base_ms: Some(500), backoff_max_ms: Some(100), ..Default::default() };
        assert!(check_link(&cfg).is_err());
        let cfg = LinkConfig { serial_dev: Some(String::new()), ..Default::default() };
        assert!(check_link(&cfg).is_err());
        assert!(check_calibration(&Calibration { weight_grams: 490.0, raw_at_weight: 0.0 }).is_err());
    }
}
