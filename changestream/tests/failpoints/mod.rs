mod stream_test;
