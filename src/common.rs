/// Address of the gauge peripheral the monitor follows unless told otherwise.
pub const DEFAULT_ADDRESS: &str = "70:04:1D:38:75:76";

pub mod services {
    use uuid::Uuid;

    pub const GAUGE: Uuid = Uuid::from_u128(0x12345678_1234_1234_1234_1234567890ab);
}

pub mod characteristics {
    use uuid::Uuid;

    /// Battery state of charge, one byte per notification.
    pub const STATE_OF_CHARGE: Uuid = Uuid::from_u128(0xabcd1234_abcd_1234_abcd_1234567890ab);
    /// Motor speed, one byte per notification.
    pub const RPM: Uuid = Uuid::from_u128(0xabcd1234_abcd_1234_abcd_1234567890ac);
}

pub mod descriptors {
    use btleplug::api::bleuuid::uuid_from_u16;
    use uuid::Uuid;

    pub const CLIENT_CHARACTERISTIC_CONFIGURATION: Uuid = uuid_from_u16(0x2902);
}
