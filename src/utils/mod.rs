pub mod startup_banner;
