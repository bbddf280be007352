//! Tests for substrate-agnostic types

use holdfast_core::types::{
    Address, Architecture, MemoryRange, Protection, RegisterContext, RegisterId, RegisterKind, RegisterValue, Scalar,
    ThreadId, VectorRegisterValue, Width, X86_64Register,
};

#[test]
fn test_address_parses_hex_and_decimal()
{
    assert_eq!("0x1000".parse::<Address>().unwrap(), Address::from(0x1000));
    assert_eq!("0X1f".parse::<Address>().unwrap(), Address::from(0x1f));
    assert_eq!("4096".parse::<Address>().unwrap(), Address::from(4096));
    assert!("0x".parse::<Address>().is_err());
    assert!("banana".parse::<Address>().is_err());
}

#[test]
fn test_address_display_is_lowercase_hex()
{
    assert_eq!(Address::from(0xABCD).to_string(), "0xabcd");
    assert_eq!(Address::ZERO.to_string(), "0x0");
}

#[test]
fn test_address_offset_applies_signed_displacement()
{
    let base = Address::from(0x1000);
    assert_eq!(base.offset(0x10), Address::from(0x1010));
    assert_eq!(base.offset(-0x10), Address::from(0xff0));
    assert_eq!(Address::from(0x1010).offset_from(base), Some(0x10));
    assert_eq!(base.offset_from(Address::from(0x1010)), None);
}

#[test]
fn test_thread_id_equality()
{
    let tid1 = ThreadId::from(7);
    let tid2 = ThreadId(7);
    assert_eq!(tid1, tid2);
    assert_ne!(tid1, ThreadId(8));
}

#[test]
fn test_width_accepts_only_power_of_two_sizes()
{
    for (size, width) in [(1, Width::One), (2, Width::Two), (4, Width::Four), (8, Width::Eight)] {
        assert_eq!(Width::try_from(size).unwrap(), width);
        assert_eq!(width.bytes(), size);
    }
    for size in [0, 3, 5, 16] {
        assert!(Width::try_from(size).is_err());
    }
}

#[test]
fn test_scalar_encoding_is_little_endian_and_truncating()
{
    assert_eq!(Scalar::from(42u32).encode(Width::Four), vec![42, 0, 0, 0]);
    assert_eq!(Scalar::Signed(-1).encode(Width::Two), vec![0xff, 0xff]);
    assert_eq!(Scalar::Unsigned(0x1_0000_002a).encode(Width::Four), vec![0x2a, 0, 0, 0]);
}

#[test]
fn test_scalar_decode_honours_signedness()
{
    let bytes = [0xfe, 0xff];
    assert_eq!(Scalar::decode(&bytes, Width::Two, true).unwrap(), Scalar::Signed(-2));
    assert_eq!(Scalar::decode(&bytes, Width::Two, false).unwrap(), Scalar::Unsigned(0xfffe));
}

#[test]
fn test_memory_range_contains()
{
    let range = MemoryRange::new(Address::from(0x1000), 0x1000, Protection::READ_WRITE, None);

    assert!(range.contains(Address::from(0x1000)));
    assert!(range.contains(Address::from(0x1fff)));
    assert!(!range.contains(Address::from(0x2000)));
    assert!(!range.contains(Address::from(0xfff)));
}

#[test]
fn test_memory_range_excluded_region_matching()
{
    let needles = vec!["[vdso]".to_string()];
    let vdso = MemoryRange::new(Address::from(0x1000), 0x1000, Protection::READ_WRITE, Some("[vdso]".into()));
    let anonymous = MemoryRange::new(Address::from(0x2000), 0x1000, Protection::READ_WRITE, None);
    assert!(vdso.matches_any(&needles));
    assert!(!anonymous.matches_any(&needles));
}

#[test]
fn test_register_names_per_architecture()
{
    assert_eq!(RegisterId::parse("PC", Architecture::Arm64).unwrap(), RegisterId::Pc);
    assert_eq!(RegisterId::parse("rip", Architecture::X86_64).unwrap(), RegisterId::Pc);
    assert_eq!(RegisterId::parse("x29", Architecture::Arm64).unwrap(), RegisterId::Fp);
    assert_eq!(
        RegisterId::parse("rax", Architecture::X86_64).unwrap(),
        RegisterId::X86_64(X86_64Register::Rax)
    );
    assert_eq!(RegisterId::parse("q3", Architecture::Arm64).unwrap(), RegisterId::Vector(3));
    assert!(RegisterId::parse("rax", Architecture::Arm64).is_err());
    assert!(RegisterId::parse("x31", Architecture::Arm64).is_err());
    assert!(RegisterId::parse("xmm16", Architecture::X86_64).is_err());
}

#[test]
fn test_register_kinds()
{
    assert_eq!(RegisterId::Pc.kind(), RegisterKind::Address);
    assert_eq!(RegisterId::Status.kind(), RegisterKind::Numeric);
    assert_eq!(RegisterId::Vector(0).kind(), RegisterKind::Vector);
}

#[test]
fn test_register_context_get_and_set()
{
    let mut registers = RegisterContext::new(Architecture::X86_64);
    let rax = RegisterId::X86_64(X86_64Register::Rax);

    assert_eq!(registers.set(rax, RegisterValue::Numeric(0x10)), Some(()));
    assert_eq!(registers.get(rax), Some(RegisterValue::Address(Address::from(0x10))));

    let vector = VectorRegisterValue::from_u128(0xdead_beef);
    assert_eq!(registers.set(RegisterId::Vector(1), RegisterValue::Vector(vector)), Some(()));
    assert_eq!(registers.get(RegisterId::Vector(1)), Some(RegisterValue::Vector(vector)));

    // A vector into a scalar register is rejected
    assert_eq!(registers.set(RegisterId::Pc, RegisterValue::Vector(vector)), None);
}

#[test]
fn test_max_instruction_size()
{
    assert_eq!(Architecture::X86_64.max_instruction_size(), 15);
    assert_eq!(Architecture::Arm64.max_instruction_size(), 4);
}
