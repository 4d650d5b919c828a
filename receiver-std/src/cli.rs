//! Command line options and their translation into library configs.

use anyhow::ensure;
use clap::Parser;

use bresser_rx::decoder::Decoder;
use bresser_rx::defaults::{DEFAULT_DEDUP_WINDOW_MS, DEFAULT_MIN_RSSI, DEFAULT_STALE_AFTER_MS};
use bresser_rx::filter::{id_list, SensorFilter};
use bresser_rx::pipeline::PipelineConfig;
use bresser_rx::radio::{reset_pin, RadioChip, RadioConfig, RadioPins, DEFAULT_CHIP};
use bresser_rx::reading::ReadingKind;
use bresser_rx::registry::MAX_DECODERS;

#[derive(Parser, Debug, Clone)]
#[command(name = "bresser-rx")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Radio chip (cc1101, sx1276, sx1262, lr1121); defaults to the build's chip
    #[arg(long, value_parser = parse_chip)]
    pub radio: Option<RadioChip>,

    /// SPI chip select pin
    #[arg(long, default_value_t = RadioPins::DEFAULT.cs)]
    pub pin_cs: u8,

    /// Interrupt pin (GDO0 / DIO0 / DIO1)
    #[arg(long, default_value_t = RadioPins::DEFAULT.irq)]
    pub pin_irq: u8,

    /// Second radio GPIO (GDO2 / BUSY)
    #[arg(long, default_value_t = RadioPins::DEFAULT.gpio)]
    pub pin_gpio: u8,

    /// Reset pin, -1 when not connected
    #[arg(long, default_value_t = 32, allow_negative_numbers = true)]
    pub pin_rst: i16,

    /// Only publish this sensor (hex id)
    #[arg(long, value_name = "HEX", value_parser = parse_sensor_id)]
    pub filter_sensor_id: Option<u32>,

    /// Publish only these sensors (comma separated hex ids)
    #[arg(long, value_name = "HEX,...", value_delimiter = ',', value_parser = parse_sensor_id)]
    pub include: Vec<u32>,

    /// Never publish these sensors (comma separated hex ids)
    #[arg(long, value_name = "HEX,...", value_delimiter = ',', value_parser = parse_sensor_id)]
    pub exclude: Vec<u32>,

    /// Ignore frames weaker than this (dBm)
    #[arg(long, default_value_t = DEFAULT_MIN_RSSI, allow_negative_numbers = true)]
    pub min_rssi: i8,

    /// Measurements to publish (e.g. temperature,humidity); all when omitted
    #[arg(long, value_delimiter = ',', value_parser = parse_kind)]
    pub measurements: Vec<ReadingKind>,

    /// Decoder priority (e.g. 7in1,6in1,5in1,lightning,leakage)
    #[arg(long, value_delimiter = ',', value_parser = parse_decoder)]
    pub decoders: Vec<Decoder>,

    /// Retransmission suppression window in ms (0 disables)
    #[arg(long, default_value_t = DEFAULT_DEDUP_WINDOW_MS)]
    pub dedup_ms: u64,

    /// Report a sensor stale after this many ms without frames
    #[arg(long, default_value_t = DEFAULT_STALE_AFTER_MS)]
    pub stale_ms: u64,

    /// Status report interval in seconds (0 disables)
    #[arg(long, default_value_t = 30)]
    pub status_secs: u64,

    /// How long the pipeline waits for a frame before sweeping for stale sensors (ms)
    #[arg(long, default_value_t = 1000)]
    pub idle_ms: u64,
}

fn parse_chip(s: &str) -> Result<RadioChip, String> {
    RadioChip::parse(s).ok_or_else(|| format!("unknown radio chip '{}'", s))
}

fn parse_sensor_id(s: &str) -> Result<u32, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(digits, 16).map_err(|e| format!("invalid sensor id '{}': {}", s, e))
}

fn parse_kind(s: &str) -> Result<ReadingKind, String> {
    ReadingKind::from_name(s).ok_or_else(|| format!("unknown measurement '{}'", s))
}

fn parse_decoder(s: &str) -> Result<Decoder, String> {
    Decoder::from_name(s).ok_or_else(|| format!("unknown decoder '{}'", s))
}

impl Cli {
    pub fn radio_config(&self) -> anyhow::Result<RadioConfig> {
        let config = RadioConfig {
            chip: self.radio.unwrap_or(DEFAULT_CHIP),
            pins: RadioPins {
                cs: self.pin_cs,
                irq: self.pin_irq,
                gpio: self.pin_gpio,
                rst: reset_pin(self.pin_rst).map_err(anyhow::Error::msg)?,
            },
        };
        config.validate().map_err(anyhow::Error::msg)?;
        Ok(config)
    }

    pub fn filter(&self) -> SensorFilter {
        SensorFilter {
            allow_id: self.filter_sensor_id,
            include: id_list(&self.include),
            exclude: id_list(&self.exclude),
            min_rssi: self.min_rssi,
        }
    }

    pub fn pipeline_config(&self) -> anyhow::Result<PipelineConfig> {
        let mut config = PipelineConfig {
            dedup_window_ms: self.dedup_ms,
            stale_after_ms: self.stale_ms,
            filter: self.filter(),
            ..PipelineConfig::default()
        };
        if !self.decoders.is_empty() {
            ensure!(
                self.decoders.len() <= MAX_DECODERS,
                "at most {} decoders can be listed",
                MAX_DECODERS
            );
            config.decoders = self.decoders.iter().copied().collect();
        }
        ensure!(self.stale_ms > 0, "--stale-ms must be positive");
        Ok(config)
    }

    /// Kinds that get a sink slot
    pub fn enabled_kinds(&self) -> Vec<ReadingKind> {
        if self.measurements.is_empty() {
            ReadingKind::ALL.to_vec()
        } else {
            self.measurements.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("bresser-rx").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults() {
        let c = cli(&[]);
        let radio = c.radio_config().unwrap();
        assert_eq!(radio.chip, DEFAULT_CHIP);
        assert_eq!(radio.pins, RadioPins::DEFAULT);
        let config = c.pipeline_config().unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(c.enabled_kinds().len(), ReadingKind::COUNT);
    }

    #[test]
    fn filter_options() {
        let c = cli(&[
            "--filter-sensor-id",
            "4711",
            "--include",
            "1,0x2,ff",
            "--exclude",
            "3",
            "--min-rssi",
            "-90",
        ]);
        let f = c.filter();
        assert_eq!(f.allow_id, Some(0x4711));
        assert_eq!(f.include.as_slice(), &[1, 2, 0xFF]);
        assert_eq!(f.exclude.as_slice(), &[3]);
        assert_eq!(f.min_rssi, -90);
    }

    #[test]
    fn decoder_order_and_measurements() {
        let c = cli(&["--decoders", "leakage,6in1", "--measurements", "temperature,rssi"]);
        let config = c.pipeline_config().unwrap();
        assert_eq!(config.decoders.as_slice(), &[Decoder::Leakage, Decoder::Bresser6In1]);
        assert_eq!(
            c.enabled_kinds(),
            vec![ReadingKind::Temperature, ReadingKind::SignalStrength]
        );
    }

    #[test]
    fn radio_overrides() {
        let c = cli(&["--radio", "sx1262", "--pin-rst", "-1"]);
        let radio = c.radio_config().unwrap();
        assert_eq!(radio.chip, RadioChip::Sx1262);
        assert_eq!(radio.pins.rst, None);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let parse = |args: &[&str]| {
            Cli::try_parse_from(std::iter::once("bresser-rx").chain(args.iter().copied()))
        };
        assert!(parse(&["--radio", "nrf24"]).is_err());
        assert!(parse(&["--measurements", "pressure"]).is_err());
        assert!(parse(&["--decoders", "8in1"]).is_err());
        assert!(parse(&["--include", "xyz"]).is_err());

        assert!(cli(&["--pin-irq", "27"]).radio_config().is_err());
        assert!(cli(&["--stale-ms", "0"]).pipeline_config().is_err());
    }
}
