//! External relay repositories.

mod redis_repo;

pub use redis_repo::RedisRepository;
