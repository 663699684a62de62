pub mod kv_cache_convert;
