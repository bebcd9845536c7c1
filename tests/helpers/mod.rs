// 集成测试共享辅助
pub mod mock_config;
