//! OHCI operational register offsets and bit assignments.
//!
//! Offsets are byte offsets from the controller MMIO base; the register file
//! is dword-only and 256 bytes long. The block at 0x60 is the vendor
//! extension (host status/reset/mask/test) carried over from the embedded
//! part this controller models.

pub const REG_REVISION: u32 = 0x00;
pub const REG_CONTROL: u32 = 0x04;
pub const REG_CMD_STATUS: u32 = 0x08;
pub const REG_INTR_STATUS: u32 = 0x0c;
pub const REG_INTR_ENABLE: u32 = 0x10;
pub const REG_INTR_DISABLE: u32 = 0x14;
pub const REG_HCCA: u32 = 0x18;
pub const REG_PERIOD_CURRENT_ED: u32 = 0x1c;
pub const REG_CONTROL_HEAD_ED: u32 = 0x20;
pub const REG_CONTROL_CURRENT_ED: u32 = 0x24;
pub const REG_BULK_HEAD_ED: u32 = 0x28;
pub const REG_BULK_CURRENT_ED: u32 = 0x2c;
pub const REG_DONE_HEAD: u32 = 0x30;
pub const REG_FM_INTERVAL: u32 = 0x34;
pub const REG_FM_REMAINING: u32 = 0x38;
pub const REG_FM_NUMBER: u32 = 0x3c;
pub const REG_PERIODIC_START: u32 = 0x40;
pub const REG_LS_THRESHOLD: u32 = 0x44;
pub const REG_RH_DESCRIPTOR_A: u32 = 0x48;
pub const REG_RH_DESCRIPTOR_B: u32 = 0x4c;
pub const REG_RH_STATUS: u32 = 0x50;
/// First HcRhPortStatus register; one dword per port follows.
pub const REG_RH_PORT_STATUS: u32 = 0x54;

// Vendor extension block.
pub const REG_HSTATUS: u32 = 0x60;
pub const REG_HRESET: u32 = 0x64;
pub const REG_HINTR_ENABLE: u32 = 0x68;
pub const REG_HINTR_TEST: u32 = 0x6c;

pub const HC_REVISION: u32 = 0x10;

// HcControl.
pub const CTL_CBSR: u32 = 0x3;
pub const CTL_PLE: u32 = 1 << 2;
pub const CTL_IE: u32 = 1 << 3;
pub const CTL_CLE: u32 = 1 << 4;
pub const CTL_BLE: u32 = 1 << 5;
pub const CTL_HCFS: u32 = 0x3 << 6;
pub const CTL_IR: u32 = 1 << 8;
pub const CTL_RWC: u32 = 1 << 9;
pub const CTL_RWE: u32 = 1 << 10;

// HostControllerFunctionalState values within CTL_HCFS.
pub const HCFS_RESET: u32 = 0x00 << 6;
pub const HCFS_RESUME: u32 = 0x01 << 6;
pub const HCFS_OPERATIONAL: u32 = 0x02 << 6;
pub const HCFS_SUSPEND: u32 = 0x03 << 6;

// HcCommandStatus.
pub const STATUS_HCR: u32 = 1 << 0;
pub const STATUS_CLF: u32 = 1 << 1;
pub const STATUS_BLF: u32 = 1 << 2;
pub const STATUS_OCR: u32 = 1 << 3;
pub const STATUS_SOC: u32 = 0x3 << 16;

// HcInterruptStatus / Enable / Disable.
pub const INTR_SO: u32 = 1 << 0;
pub const INTR_WD: u32 = 1 << 1;
pub const INTR_SF: u32 = 1 << 2;
pub const INTR_RD: u32 = 1 << 3;
pub const INTR_UE: u32 = 1 << 4;
pub const INTR_FNO: u32 = 1 << 5;
pub const INTR_RHSC: u32 = 1 << 6;
pub const INTR_OC: u32 = 1 << 30;
pub const INTR_MIE: u32 = 1 << 31;

// HcFmInterval.
pub const FMI_FI: u32 = 0x3fff;
pub const FMI_FSMPS: u32 = 0x7fff << 16;
pub const FMI_FIT: u32 = 1 << 31;

// HcFmRemaining.
pub const FR_MASK: u32 = 0x3fff;
pub const FR_FRT: u32 = 1 << 31;

// HcRhDescriptorA.
pub const RHA_NDP_MASK: u32 = 0xff;
pub const RHA_PSM: u32 = 1 << 8;
pub const RHA_NPS: u32 = 1 << 9;
pub const RHA_DT: u32 = 1 << 10;
pub const RHA_OCPM: u32 = 1 << 11;
pub const RHA_NOCP: u32 = 1 << 12;
/// No bits of HcRhDescriptorA are software-writable on this part.
pub const RHA_RW_MASK: u32 = 0x0000_0000;

// HcRhStatus.
pub const RHS_LPS: u32 = 1 << 0;
pub const RHS_OCI: u32 = 1 << 1;
pub const RHS_DRWE: u32 = 1 << 15;
pub const RHS_LPSC: u32 = 1 << 16;
pub const RHS_OCIC: u32 = 1 << 17;
pub const RHS_CRWE: u32 = 1 << 31;

// HcRhPortStatus.
pub const PORT_CCS: u32 = 1 << 0;
pub const PORT_PES: u32 = 1 << 1;
pub const PORT_PSS: u32 = 1 << 2;
pub const PORT_POCI: u32 = 1 << 3;
pub const PORT_PRS: u32 = 1 << 4;
pub const PORT_PPS: u32 = 1 << 8;
pub const PORT_LSDA: u32 = 1 << 9;
pub const PORT_CSC: u32 = 1 << 16;
pub const PORT_PESC: u32 = 1 << 17;
pub const PORT_PSSC: u32 = 1 << 18;
pub const PORT_OCIC: u32 = 1 << 19;
pub const PORT_PRSC: u32 = 1 << 20;
/// Change bits, write-1-to-clear.
pub const PORT_WTC: u32 = PORT_CSC | PORT_PESC | PORT_PSSC | PORT_OCIC | PORT_PRSC;

// Vendor HcHReset.
pub const HRESET_FSBIR: u32 = 1 << 0;

pub const HCCA_MASK: u32 = 0xffff_ff00;
pub const EDPTR_MASK: u32 = 0xffff_fff0;
pub const DPTR_MASK: u32 = 0xffff_fff0;

pub const LS_THRESHOLD_DEFAULT: u32 = 0x628;
pub const FI_DEFAULT: u32 = 0x2edf;
pub const FSMPS_DEFAULT: u32 = 0x2778;
