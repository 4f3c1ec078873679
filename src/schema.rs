// Mirrors migrations/2020-01-01-000000_create_points.

diesel::table! {
    // TimescaleDB hypertable partitioned on `time`
    points (measurement, time, tags) {
        time -> Timestamptz,
        measurement -> Text,
        value -> Double,
        tags -> Jsonb,
    }
}
