pub mod redis_bus;

pub use redis_bus::RedisRoomBus;
