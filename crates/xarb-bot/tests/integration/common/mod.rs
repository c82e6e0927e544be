pub mod mock_venue;
