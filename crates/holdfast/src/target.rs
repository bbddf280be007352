//! Building the emulated target and agent options from configuration.

use std::sync::Arc;
use std::time::Duration;

use holdfast_core::agent::AgentOptions;
use holdfast_core::error::{HoldfastError, HoldfastResult};
use holdfast_core::platform::emulated::{EmulatedInstruction, EmulatedTarget};
use holdfast_core::scan::ScanOptions;
use holdfast_core::substrate::{AccessKind, MemoryOperand};
use holdfast_core::types::{Address, Architecture, Protection, RegisterId};
use holdfast_utils::config::{HoldfastConfig, TargetConfig};
use holdfast_utils::{debug, info};

/// Writable data region of the built-in layout.
pub const DEMO_DATA: u64 = 0x0001_0000;
/// Code region of the built-in layout.
pub const DEMO_CODE: u64 = 0x0040_0000;
/// Store of a 4-byte counter at `DEMO_DATA + 0x10`.
pub const DEMO_STORE: u64 = DEMO_CODE + 0x10;
/// Load of the same counter.
pub const DEMO_LOAD: u64 = DEMO_CODE + 0x20;
/// Plain instruction used as a breakpoint site.
pub const DEMO_ENTRY: u64 = DEMO_CODE + 0x30;

/// Architecture named by `target.architecture`.
pub fn architecture(name: &str) -> HoldfastResult<Architecture>
{
    match name {
        "host" => Ok(Architecture::current()),
        "arm64" => Ok(Architecture::Arm64),
        "x86_64" => Ok(Architecture::X86_64),
        other => Err(HoldfastError::InvalidArgument(format!("unknown architecture: {other}"))),
    }
}

/// Agent options from the `[freeze]` and `[scan]` tables.
pub fn agent_options(config: &HoldfastConfig) -> AgentOptions
{
    AgentOptions {
        freeze_interval: Duration::from_millis(config.freeze.interval_ms),
        scan: ScanOptions {
            excluded_regions: config.scan.excluded_regions.clone(),
            string_max_length: config.scan.string_max_length,
        },
        default_page_size: config.scan.default_page_size,
    }
}

/// Build the emulated target described by `config`.
///
/// An empty region list selects the built-in layout (see [`demo_layout`]).
///
/// ## Errors
///
/// - `InvalidArgument`: unknown architecture, malformed protection or overlapping regions
pub fn build_target(config: &TargetConfig) -> HoldfastResult<Arc<EmulatedTarget>>
{
    let architecture = architecture(&config.architecture)?;
    let target =
        EmulatedTarget::new(architecture).with_slot_limits(config.breakpoint_slots, config.watchpoint_slots);

    if config.regions.is_empty() {
        demo_layout(&target)?;
    } else {
        for region in &config.regions {
            let protection: Protection = region.protection.parse()?;
            target.map(Address::from(region.base), region.size, protection, region.file.as_deref())?;
            debug!(base = %Address::from(region.base), size = region.size, %protection, "Mapped region");
        }
    }

    info!(
        %architecture,
        regions = target.ranges().len(),
        breakpoint_slots = config.breakpoint_slots,
        watchpoint_slots = config.watchpoint_slots,
        "Emulated target ready"
    );
    Ok(Arc::new(target))
}

/// Map the built-in layout: one data page, one file-backed code page and a
/// few decoded instructions touching a counter in the data page.
///
/// Memory operands use a zero base register with an absolute displacement,
/// so traps raised with zeroed registers still hit the counter.
///
/// ## Errors
///
/// - `InvalidArgument`: the layout overlaps an existing mapping
pub fn demo_layout(target: &EmulatedTarget) -> HoldfastResult<()>
{
    target.map(Address::from(DEMO_DATA), 0x1000, Protection::READ_WRITE, Some("[heap]"))?;
    target.map(Address::from(DEMO_CODE), 0x1000, Protection::READ_EXECUTE, Some("/opt/holdfast/demo"))?;

    let counter = displacement(DEMO_DATA + 0x10);
    target.define_instruction(
        Address::from(DEMO_STORE),
        EmulatedInstruction::new(4, "str w1, [sp, #0x10010]").with_operand(MemoryOperand {
            base: RegisterId::Sp,
            displacement: counter,
            access: AccessKind::Write,
        }),
    );
    target.define_instruction(
        Address::from(DEMO_LOAD),
        EmulatedInstruction::new(4, "ldr w2, [sp, #0x10010]").with_operand(MemoryOperand {
            base: RegisterId::Sp,
            displacement: counter,
            access: AccessKind::Read,
        }),
    );
    target.define_instruction(Address::from(DEMO_ENTRY), EmulatedInstruction::new(4, "nop"));

    target.poke(Address::from(DEMO_DATA + 0x10), &100u32.to_le_bytes())?;
    target.poke(Address::from(DEMO_DATA + 0x100), b"holdfast\0")?;
    Ok(())
}

fn displacement(address: u64) -> i64
{
    i64::try_from(address).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests
{
    use holdfast_core::substrate::MemoryAccess;
    use holdfast_utils::config::RegionConfig;

    use super::*;

    #[test]
    fn test_default_config_uses_demo_layout()
    {
        let target = build_target(&TargetConfig::default()).unwrap();
        let ranges = target.ranges();
        assert_eq!(ranges.len(), 2);
        assert_eq!(
            target.read_memory(Address::from(DEMO_DATA + 0x10), 4).unwrap(),
            100u32.to_le_bytes().to_vec()
        );
    }

    #[test]
    fn test_configured_regions()
    {
        let config = TargetConfig {
            architecture: "x86_64".to_string(),
            regions: vec![
                RegionConfig {
                    base: 0x1000,
                    size: 0x1000,
                    protection: "rw-".to_string(),
                    file: None,
                },
                RegionConfig {
                    base: 0x8000,
                    size: 0x1000,
                    protection: "r-x".to_string(),
                    file: Some("/bin/game".to_string()),
                },
            ],
            ..TargetConfig::default()
        };
        let target = build_target(&config).unwrap();
        let ranges = target.ranges();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[1].file.as_deref(), Some("/bin/game"));
    }

    #[test]
    fn test_unknown_architecture()
    {
        assert!(architecture("mips").is_err());
        assert_eq!(architecture("arm64").unwrap(), Architecture::Arm64);
    }

    #[test]
    fn test_agent_options_follow_config()
    {
        let mut config = HoldfastConfig::default();
        config.freeze.interval_ms = 5;
        config.scan.default_page_size = 10;
        let options = agent_options(&config);
        assert_eq!(options.freeze_interval, Duration::from_millis(5));
        assert_eq!(options.default_page_size, 10);
        assert_eq!(options.scan.excluded_regions.len(), 4);
    }
}
