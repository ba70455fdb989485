pub mod canvas;
pub mod config;
pub mod cron;
pub mod db;
pub mod mailer;
pub mod models;
pub mod points;
pub mod progression;
pub mod routes;
pub mod store;
pub mod tracker;
