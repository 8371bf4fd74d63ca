pub mod access_service;
pub mod analytics_service;
pub mod billing_service;
pub mod catalog_service;
pub mod cookie_service;
pub mod extraction;
pub mod extraction_service;
pub mod monitoring;
pub mod subscription_service;
pub mod user_service;
