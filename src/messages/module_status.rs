//! `0xED` module status. Three device classes share the command; the data
//! length picks the layout: VMB6IN sends 5 bytes, VMB8PBU (and VMBEL1/2/4)
//! 7 bytes, VMBELO 8 bytes.

use crate::field::{Bitmap, EnumValue, FieldType};
use crate::schema::{MessageSchema, SchemaBuilder, PRIORITY_LOW};

pub const COMMAND_MODULE_STATUS: u8 = 0xed;

pub const MODULE_STATUS_8PBU: &str = "ModuleStatus8PBU";
pub const MODULE_STATUS_6IN: &str = "ModuleStatus6IN";
pub const MODULE_STATUS_VMBELO: &str = "ModuleStatusVMBELO";

const PAGES: [(u32, &str); 30] = [
    (0, "Button_page_1"),
    (1, "Button_page_2"),
    (2, "Button_page_3"),
    (3, "Button_page_4"),
    (4, "Button_page_5"),
    (5, "Button_page_6"),
    (6, "Button_page_7"),
    (7, "Button_page_8"),
    (8, "Counter_page_1"),
    (9, "Counter_page_2"),
    (10, "Counter_page_3"),
    (11, "Counter_page_4"),
    (12, "Local_temperature_page"),
    (13, "Remote_temperature_page_1"),
    (14, "Remote_temperature_page_2"),
    (15, "Remote_temperature_page_3"),
    (16, "Remote_temperature_page_4"),
    (17, "Remote_temperature_page_5"),
    (18, "Remote_temperature_page_6"),
    (19, "Remote_temperature_page_7"),
    (20, "Remote_temperature_page_8"),
    (21, "Remote_temperature_page_9"),
    (22, "Remote_temperature_page_10"),
    (23, "Remote_temperature_page_11"),
    (24, "Remote_temperature_page_12"),
    (25, "Analog_sensor_page_1"),
    (26, "Analog_sensor_page_2"),
    (27, "Analog_sensor_page_3"),
    (28, "Analog_sensor_page_4"),
    (29, "Clock_page"),
];

fn local_global() -> FieldType {
    FieldType::enumeration(1, &[(0, "Local"), (1, "Global")])
}

fn program() -> FieldType {
    FieldType::enumeration(2, &[(0, "No"), (1, "Summer"), (2, "Winter"), (3, "Holiday")])
}

fn on_off() -> FieldType {
    FieldType::enumeration(1, &[(0, "Off"), (1, "On")])
}

fn channels() -> FieldType {
    FieldType::bitmap(8)
}

fn no_channels() -> Bitmap {
    Bitmap::zero(8)
}

/// Shared trailing status byte: sunrise/sunset programs, alarms, program.
fn program_byte(builder: SchemaBuilder) -> SchemaBuilder {
    builder
        .field("prog_sunset_enabled", FieldType::boolean(), false)
        .field("prog_sunrise_enabled", FieldType::boolean(), false)
        .field("alarm2", local_global(), EnumValue::raw(0))
        .field("alarm2_enabled", FieldType::boolean(), false)
        .field("alarm1", local_global(), EnumValue::raw(0))
        .field("alarm1_enabled", FieldType::boolean(), false)
        .field("program", program(), EnumValue::raw(0))
}

pub fn module_status_8pbu() -> MessageSchema {
    let builder = MessageSchema::builder(MODULE_STATUS_8PBU, COMMAND_MODULE_STATUS)
        .priority(PRIORITY_LOW)
        .field("channel_pressed", channels(), no_channels())
        .field("channel_enabled", channels(), no_channels())
        .field("channel_not_inverted", channels(), no_channels())
        .field("channel_locked", channels(), no_channels())
        .field("channel_program_disabled", channels(), no_channels());
    program_byte(builder).build()
}

pub fn module_status_6in() -> MessageSchema {
    MessageSchema::builder(MODULE_STATUS_6IN, COMMAND_MODULE_STATUS)
        .priority(PRIORITY_LOW)
        .field("input_status", channels(), no_channels())
        .field("leds_on", channels(), no_channels())
        .field("leds_slow_blink", channels(), no_channels())
        .field("leds_fast_blink", channels(), no_channels())
        .build()
}

pub fn module_status_vmbelo() -> MessageSchema {
    let builder = MessageSchema::builder(MODULE_STATUS_VMBELO, COMMAND_MODULE_STATUS)
        .priority(PRIORITY_LOW)
        .field("channel_pressed", channels(), no_channels())
        .field("channel_enabled", channels(), no_channels())
        .field("open_collector_output_on", FieldType::boolean(), false)
        .field("open_collector_output_locked", FieldType::boolean(), false)
        .field("open_collector_output_program_disabled", FieldType::boolean(), false)
        .field("temperature_sensor_program_disabled", FieldType::boolean(), false)
        .field("edge_color_inhibited", FieldType::boolean(), false)
        // three unused bits
        .field("reserved_bit1", FieldType::boolean(), false)
        .field("reserved_bit2", FieldType::boolean(), false)
        .field("reserved_bit3", FieldType::boolean(), false)
        .field("channel_locked", channels(), no_channels())
        .field("channel_program_disabled", channels(), no_channels());

    program_byte(builder)
        .field("display", on_off(), EnumValue::raw(0))
        .field("screen_saver", on_off(), EnumValue::raw(0))
        .field("menu_page", FieldType::boolean(), false)
        .field("page", FieldType::enumeration(5, &PAGES), EnumValue::raw(0))
        .build()
}

pub fn schemas() -> Vec<MessageSchema> {
    vec![module_status_8pbu(), module_status_6in(), module_status_vmbelo()]
}
