//! Thermostat sensor settings (VMBEL1/2/4, VMBGPO…), split over four messages
//! and requested with `0xE7`. Temperatures are signed half degrees.

use crate::field::FieldType;
use crate::schema::{MessageSchema, PRIORITY_LOW};

pub const COMMAND_SENSOR_SETTINGS_REQUEST: u8 = 0xe7;
pub const COMMAND_SENSOR_SETTINGS_1: u8 = 0xe8;
pub const COMMAND_SENSOR_SETTINGS_2: u8 = 0xe9;
pub const COMMAND_SENSOR_SETTINGS_3: u8 = 0xc6;
pub const COMMAND_SENSOR_SETTINGS_4: u8 = 0xb9;

pub const SENSOR_SETTINGS_REQUEST: &str = "SensorSettingsRequest";

/// `default_sleep_timer` value selecting manual mode.
pub const SLEEP_TIMER_MANUAL: u32 = 0xffff;

const HALF_DEGREE: f64 = 0.5;

fn temperature() -> FieldType {
    FieldType::temperature(8, HALF_DEGREE)
}

fn byte() -> FieldType {
    FieldType::uint(8)
}

pub fn sensor_settings_request() -> MessageSchema {
    MessageSchema::builder(SENSOR_SETTINGS_REQUEST, COMMAND_SENSOR_SETTINGS_REQUEST)
        .priority(PRIORITY_LOW)
        .build()
}

pub fn sensor_settings_1() -> MessageSchema {
    MessageSchema::builder("SensorSettings1", COMMAND_SENSOR_SETTINGS_1)
        .priority(PRIORITY_LOW)
        .field("current_temperature_set", temperature(), 0.0)
        .field("comfort_temperature_set_for_heating", temperature(), 0.0)
        .field("day_temperature_set_for_heating", temperature(), 0.0)
        .field("night_temperature_set_for_heating", temperature(), 0.0)
        .field("anti_frost_temperature_set_for_heating", temperature(), 0.0)
        .field("boost_temperature_difference_set", temperature(), 0.0)
        // TODO: the module only uses the low 5 bits for hysteresis (VMBEL1/2/4 protocol, p. 9)
        .field("hysteresis_temperature", temperature(), 0.0)
        .build()
}

pub fn sensor_settings_2() -> MessageSchema {
    MessageSchema::builder("SensorSettings2", COMMAND_SENSOR_SETTINGS_2)
        .priority(PRIORITY_LOW)
        .field("comfort_temperature_set_for_cooling", temperature(), 0.0)
        .field("day_temperature_set_for_cooling", temperature(), 0.0)
        .field("night_temperature_set_for_cooling", temperature(), 0.0)
        .field("save_temperature_set_for_cooling", temperature(), 0.0)
        // minutes, 1..=0xfeff; SLEEP_TIMER_MANUAL selects manual mode
        .field("default_sleep_timer", FieldType::uint(16), 0u32)
        .field("send_temperature_interval", byte(), 0u32)
        .build()
}

pub fn sensor_settings_3() -> MessageSchema {
    MessageSchema::builder("SensorSettings3", COMMAND_SENSOR_SETTINGS_3)
        .priority(PRIORITY_LOW)
        .field("temperature_alarm_1", temperature(), 0.0)
        .field("temperature_alarm_4", temperature(), 0.0)
        .field("lower_temperature_range_cooling", temperature(), 0.0)
        .field("upper_temperature_range_heating", temperature(), 0.0)
        .field("calibration_offset_factor", temperature(), 0.0)
        .field("zone_number", byte(), 0u32)
        .field("calibration_gain_factor", byte(), 0u32)
        .build()
}

pub fn sensor_settings_4() -> MessageSchema {
    MessageSchema::builder("SensorSettings4", COMMAND_SENSOR_SETTINGS_4)
        .priority(PRIORITY_LOW)
        .field("min_switching_time", byte(), 0u32)
        .field("pump_delay_on_time", byte(), 0u32)
        .field("pump_delay_off_time", byte(), 0u32)
        .field("temperature_alarm_2", temperature(), 0.0)
        .field("temperature_alarm_3", temperature(), 0.0)
        .field("lower_temperature_range_heating", temperature(), 0.0)
        .field("upper_temperature_range_cooling", temperature(), 0.0)
        .build()
}

pub fn schemas() -> Vec<MessageSchema> {
    vec![
        sensor_settings_request(),
        sensor_settings_1(),
        sensor_settings_2(),
        sensor_settings_3(),
        sensor_settings_4(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldValue;
    use crate::messages::builtin_registry;
    use crate::protocol::Frame;

    #[test]
    fn test_every_part_fills_a_full_frame() {
        for schema in [sensor_settings_1(), sensor_settings_2(), sensor_settings_3(), sensor_settings_4()] {
            assert_eq!(schema.data_len(), 8, "{}", schema.name());
        }
        assert_eq!(sensor_settings_request().data_len(), 1);
    }

    #[test]
    fn test_decode_settings_2() {
        let registry = builtin_registry().unwrap();
        let frame = Frame::new(
            0x40,
            COMMAND_SENSOR_SETTINGS_2,
            &[0x2e, 0x2c, 0x24, 0xf6, 0xff, 0xff, 0x0a],
        )
        .unwrap();
        let message = registry.decode(&frame).unwrap();
        assert_eq!(message.get("comfort_temperature_set_for_cooling"), Some(&FieldValue::Temperature(23.0)));
        assert_eq!(message.get("save_temperature_set_for_cooling"), Some(&FieldValue::Temperature(-5.0)));
        assert_eq!(message.get("default_sleep_timer"), Some(&FieldValue::UInt(SLEEP_TIMER_MANUAL)));
        assert_eq!(message.get("send_temperature_interval"), Some(&FieldValue::UInt(10)));
    }
}
