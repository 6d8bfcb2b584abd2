//! Protocol constants: framing, command codes, service classes and well-known registers.

// Framing
pub const FRAME_HEADER_SIZE: usize = 12;
pub const PACKET_HEADER_SIZE: usize = 16;
pub const MAX_PAYLOAD_SIZE: usize = 236;
pub const MAX_FRAME_BODY_SIZE: usize = 240;
pub const MAX_FRAME_SIZE: usize = FRAME_HEADER_SIZE + MAX_FRAME_BODY_SIZE;

pub const FRAME_FLAG_COMMAND: u8 = 0x01;
pub const FRAME_FLAG_ACK_REQUESTED: u8 = 0x02;
pub const FRAME_FLAG_IDENTIFIER_IS_SERVICE_CLASS: u8 = 0x04;

pub const SERVICE_INDEX_MASK: u8 = 0x3f;
pub const SERVICE_INDEX_CTRL: u8 = 0x00;
pub const SERVICE_INDEX_MAX_NORMAL: u8 = 0x30;
pub const SERVICE_INDEX_PIPE: u8 = 0x3e;
pub const SERVICE_INDEX_CRC_ACK: u8 = 0x3f;

// Command codes
pub const CMD_GET_REG: u16 = 0x1000;
pub const CMD_SET_REG: u16 = 0x2000;
pub const CMD_TYPE_MASK: u16 = 0xf000;
pub const CMD_REG_MASK: u16 = 0x0fff;
pub const CMD_EVENT_MASK: u16 = 0x8000;
pub const CMD_EVENT_CODE_MASK: u16 = 0xff;
pub const CMD_EVENT_COUNTER_MASK: u8 = 0x7f;
pub const CMD_EVENT_COUNTER_POS: u16 = 8;
pub const CMD_ADVERTISEMENT_DATA: u16 = 0x00;

// Pipes
pub const PIPE_PORT_SHIFT: u16 = 7;
pub const PIPE_COUNTER_MASK: u16 = 0x001f;
pub const PIPE_CLOSE_MASK: u16 = 0x0020;
pub const PIPE_METADATA_MASK: u16 = 0x0040;

// Control announce flags
pub const ANNOUNCE_RESTART_COUNTER_MASK: u16 = 0x000f;
pub const ANNOUNCE_SUPPORTS_ACK: u16 = 0x0100;
pub const ANNOUNCE_SUPPORTS_BROADCAST: u16 = 0x0200;
pub const ANNOUNCE_SUPPORTS_FRAMES: u16 = 0x0400;
pub const ANNOUNCE_IS_CLIENT: u16 = 0x0800;

// Service classes
pub const SRV_CONTROL: u32 = 0x0000_0000;
pub const SRV_LOGGER: u32 = 0x12dc_1fca;
pub const SRV_ROLE_MANAGER: u32 = 0x1e4b_7e66;
pub const SRV_SETTINGS: u32 = 0x1107_dc4a;
pub const SRV_PROXY: u32 = 0x16f1_9949;
pub const SRV_UNIQUE_BRAIN: u32 = 0x103c_4ee5;
pub const SRV_DASHBOARD: u32 = 0x1be5_9107;
pub const SRV_BRIDGE: u32 = 0x1fe5_b46f;
pub const SRV_BUTTON: u32 = 0x1473_a263;
pub const SRV_POTENTIOMETER: u32 = 0x1f27_4746;
pub const SRV_LED: u32 = 0x1609_d4f0;

// System registers
pub const REG_INTENSITY: u16 = 0x001;
pub const REG_VALUE: u16 = 0x002;
pub const REG_STREAMING_SAMPLES: u16 = 0x003;
pub const REG_STREAMING_INTERVAL: u16 = 0x004;
pub const REG_READING: u16 = 0x101;
pub const REG_STATUS_CODE: u16 = 0x103;
pub const REG_INSTANCE_NAME: u16 = 0x109;

// Control registers
pub const REG_CTRL_RESET_IN: u16 = 0x080;
pub const REG_CTRL_DEVICE_DESCRIPTION: u16 = 0x180;
pub const REG_CTRL_PRODUCT_IDENTIFIER: u16 = 0x181;
pub const REG_CTRL_FIRMWARE_VERSION: u16 = 0x185;
pub const REG_CTRL_UPTIME: u16 = 0x186;

// System events
pub const EVT_ACTIVE: u8 = 0x01;
pub const EVT_INACTIVE: u8 = 0x02;
pub const EVT_CHANGE: u8 = 0x03;
pub const EVT_STATUS_CODE_CHANGED: u8 = 0x04;

// Button
pub const EVT_BUTTON_DOWN: u8 = 0x01;
pub const EVT_BUTTON_UP: u8 = 0x02;
pub const EVT_BUTTON_HOLD: u8 = 0x81;

// Role manager
pub const CMD_ROLE_MANAGER_SET_ROLE: u16 = 0x81;
pub const CMD_ROLE_MANAGER_LIST_ROLES: u16 = 0x83;
pub const CMD_ROLE_MANAGER_CLEAR_ALL_ROLES: u16 = 0x84;
pub const REG_ROLE_MANAGER_AUTO_BIND: u16 = 0x080;
pub const REG_ROLE_MANAGER_ALL_ROLES_ALLOCATED: u16 = 0x181;
